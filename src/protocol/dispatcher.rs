use crate::core::codec::HeaderPreview;
use crate::error::constants::{
    ERR_DISPATCHER_READ_LOCK, ERR_DISPATCHER_WRITE_LOCK, ERR_TX_CACHE_LOCK,
};
use crate::error::{RelayError, Result};
use crate::protocol::message::{Message, MessageType};
use crate::service::tx_cache::TxCache;
use crate::transport::ConnectionId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use uuid::Uuid;

type HandlerFn = dyn Fn(&mut HandlerContext<'_>, &Message) -> Result<()> + Send + Sync + 'static;
type PreviewFn = dyn Fn(ConnectionId, &HeaderPreview, &[u8]) -> Result<()> + Send + Sync + 'static;

/// What a handler may touch while processing one message.
pub struct HandlerContext<'a> {
    pub conn_id: ConnectionId,
    pub peer_id: Option<Uuid>,
    pub network_num: u32,
    tx_cache: &'a Mutex<TxCache>,
    replies: Vec<Message>,
}

impl<'a> HandlerContext<'a> {
    pub fn new(
        conn_id: ConnectionId,
        peer_id: Option<Uuid>,
        network_num: u32,
        tx_cache: &'a Mutex<TxCache>,
    ) -> Self {
        Self {
            conn_id,
            peer_id,
            network_num,
            tx_cache,
            replies: Vec::new(),
        }
    }

    pub fn tx_cache(&self) -> Result<MutexGuard<'a, TxCache>> {
        self.tx_cache
            .lock()
            .map_err(|_| RelayError::LockPoisoned(ERR_TX_CACHE_LOCK))
    }

    /// Queue a message to send back on this connection.
    pub fn reply(&mut self, msg: Message) {
        self.replies.push(msg);
    }

    pub fn into_replies(self) -> Vec<Message> {
        self.replies
    }
}

/// Per-message-type handler table, shared by every connection of a node.
///
/// Handshake and keepalive messages are handled by the connection itself;
/// everything else is routed here.
#[derive(Clone)]
pub struct Dispatcher {
    handlers: Arc<RwLock<HashMap<MessageType, Box<HandlerFn>>>>,
    previews: Arc<RwLock<HashMap<MessageType, Box<PreviewFn>>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            previews: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn register<F>(&self, msg_type: MessageType, handler: F) -> Result<()>
    where
        F: Fn(&mut HandlerContext<'_>, &Message) -> Result<()> + Send + Sync + 'static,
    {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| RelayError::LockPoisoned(ERR_DISPATCHER_WRITE_LOCK))?;

        handlers.insert(msg_type, Box::new(handler));
        Ok(())
    }

    /// Register a hook that sees a message's buffered bytes before the whole
    /// payload has arrived.
    pub fn register_preview<F>(&self, msg_type: MessageType, hook: F) -> Result<()>
    where
        F: Fn(ConnectionId, &HeaderPreview, &[u8]) -> Result<()> + Send + Sync + 'static,
    {
        let mut previews = self
            .previews
            .write()
            .map_err(|_| RelayError::LockPoisoned(ERR_DISPATCHER_WRITE_LOCK))?;

        previews.insert(msg_type, Box::new(hook));
        Ok(())
    }

    pub fn has_handler(&self, msg_type: MessageType) -> Result<bool> {
        let handlers = self
            .handlers
            .read()
            .map_err(|_| RelayError::LockPoisoned(ERR_DISPATCHER_READ_LOCK))?;
        Ok(handlers.contains_key(&msg_type))
    }

    /// Run the handler for `msg`. Returns `false` when none is registered.
    pub fn dispatch(&self, ctx: &mut HandlerContext<'_>, msg: &Message) -> Result<bool> {
        let handlers = self
            .handlers
            .read()
            .map_err(|_| RelayError::LockPoisoned(ERR_DISPATCHER_READ_LOCK))?;

        match handlers.get(&msg.msg_type()) {
            Some(handler) => handler(ctx, msg).map(|()| true),
            None => Ok(false),
        }
    }

    /// Run the preview hook for `msg_type`, if any.
    pub fn preview(
        &self,
        msg_type: MessageType,
        conn_id: ConnectionId,
        header: &HeaderPreview,
        buffered: &[u8],
    ) -> Result<()> {
        let previews = self
            .previews
            .read()
            .map_err(|_| RelayError::LockPoisoned(ERR_DISPATCHER_READ_LOCK))?;

        match previews.get(&msg_type) {
            Some(hook) => hook(conn_id, header, buffered),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_handler_after_register() {
        let dispatcher = Dispatcher::new();
        assert!(!dispatcher.has_handler(MessageType::Tx).unwrap());

        dispatcher
            .register(MessageType::Tx, |_, _| Ok(()))
            .unwrap();
        assert!(dispatcher.has_handler(MessageType::Tx).unwrap());
        assert!(!dispatcher.has_handler(MessageType::Txs).unwrap());
    }

    #[test]
    fn test_poisoned_table_reports_lock_error() {
        let dispatcher = Dispatcher::new();
        let handlers = dispatcher.handlers.clone();
        let _ = std::thread::spawn(move || {
            let _guard = handlers.write();
            panic!("poison the handler table");
        })
        .join();

        assert!(matches!(
            dispatcher.has_handler(MessageType::Tx),
            Err(RelayError::LockPoisoned(ERR_DISPATCHER_READ_LOCK))
        ));
        assert!(matches!(
            dispatcher.register(MessageType::Tx, |_, _| Ok(())),
            Err(RelayError::LockPoisoned(ERR_DISPATCHER_WRITE_LOCK))
        ));
    }
}
