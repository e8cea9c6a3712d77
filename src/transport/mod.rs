//! Named-connection transport
//!
//! In-process rendition of the I/O manager the orchestrator is written
//! against: bounded typed channels addressed by connection name, with
//! either direct receive or a registered delivery callback per connection.
//! Messages on one connection are delivered strictly in order, one at a
//! time; independent connections deliver concurrently.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::TransportError;

/// Delivery callback invoked for every message on a bound connection.
pub type Callback<T> = Box<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

struct Connection<T> {
    name: String,
    tx: mpsc::Sender<T>,
    /// `None` while a callback task owns the stream.
    rx: Mutex<Option<mpsc::Receiver<T>>>,
    callback: Mutex<Option<CallbackHandle<T>>>,
}

struct CallbackHandle<T> {
    stop_tx: watch::Sender<bool>,
    /// Hands the stream back once the delivery task has wound down.
    done_rx: oneshot::Receiver<mpsc::Receiver<T>>,
}

/// Sending half of a named connection. Cheap to clone.
#[derive(Clone)]
pub struct ChannelSender<T> {
    name: String,
    tx: mpsc::Sender<T>,
}

impl<T: Send + 'static> ChannelSender<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bounded enqueue: blocks until there is room or `timeout` elapses.
    pub async fn send(&self, value: T, timeout: Duration) -> Result<(), TransportError> {
        match self.tx.send_timeout(value, timeout).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => Err(TransportError::SendTimeout {
                name: self.name.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(TransportError::Closed {
                name: self.name.clone(),
            }),
        }
    }
}

/// Receiving half of a named connection, for direct (pull) receipt.
pub struct ChannelReceiver<T> {
    conn: Arc<Connection<T>>,
}

impl<T: Send + 'static> ChannelReceiver<T> {
    pub fn name(&self) -> &str {
        &self.conn.name
    }

    /// Pull the next message; fails while a callback owns the stream.
    pub async fn recv(&self, timeout: Duration) -> Result<T, TransportError> {
        let mut guard = self.conn.rx.lock().await;
        let rx = guard.as_mut().ok_or_else(|| TransportError::CallbackBound {
            name: self.conn.name.clone(),
        })?;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Err(TransportError::Closed {
                name: self.conn.name.clone(),
            }),
            Err(_) => Err(TransportError::RecvTimeout {
                name: self.conn.name.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

/// Registry of named typed connections.
#[derive(Default)]
pub struct IoManager {
    connections: RwLock<HashMap<String, Box<dyn Any + Send + Sync>>>,
}

impl IoManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a named connection carrying messages of type `T`.
    pub async fn open<T: Send + 'static>(
        &self,
        name: &str,
        capacity: usize,
    ) -> Result<(), TransportError> {
        let mut connections = self.connections.write().await;
        if connections.contains_key(name) {
            return Err(TransportError::AlreadyOpen {
                name: name.to_string(),
            });
        }
        let (tx, rx) = mpsc::channel::<T>(capacity);
        let conn = Arc::new(Connection {
            name: name.to_string(),
            tx,
            rx: Mutex::new(Some(rx)),
            callback: Mutex::new(None),
        });
        connections.insert(name.to_string(), Box::new(conn));
        debug!(connection = name, capacity, "connection opened");
        Ok(())
    }

    async fn connection<T: Send + 'static>(
        &self,
        name: &str,
    ) -> Result<Arc<Connection<T>>, TransportError> {
        let connections = self.connections.read().await;
        let entry = connections
            .get(name)
            .ok_or_else(|| TransportError::ConnectionNotFound {
                name: name.to_string(),
            })?;
        entry
            .downcast_ref::<Arc<Connection<T>>>()
            .cloned()
            .ok_or_else(|| TransportError::TypeMismatch {
                name: name.to_string(),
            })
    }

    /// Typed sender handle for a named connection.
    pub async fn get_sender<T: Send + 'static>(
        &self,
        name: &str,
    ) -> Result<ChannelSender<T>, TransportError> {
        let conn = self.connection::<T>(name).await?;
        Ok(ChannelSender {
            name: conn.name.clone(),
            tx: conn.tx.clone(),
        })
    }

    /// Typed receiver handle for a named connection.
    pub async fn get_receiver<T: Send + 'static>(
        &self,
        name: &str,
    ) -> Result<ChannelReceiver<T>, TransportError> {
        let conn = self.connection::<T>(name).await?;
        Ok(ChannelReceiver { conn })
    }

    /// Register a delivery callback on a connection.
    ///
    /// A dedicated task pulls messages and awaits the callback for each,
    /// so deliveries on this connection never overlap.
    pub async fn add_callback<T: Send + 'static>(
        &self,
        name: &str,
        callback: Callback<T>,
    ) -> Result<(), TransportError> {
        let conn = self.connection::<T>(name).await?;
        let mut slot = conn.callback.lock().await;
        if slot.is_some() {
            return Err(TransportError::CallbackBound {
                name: name.to_string(),
            });
        }
        let mut rx = conn
            .rx
            .lock()
            .await
            .take()
            .ok_or_else(|| TransportError::CallbackBound {
                name: name.to_string(),
            })?;

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let (done_tx, done_rx) = oneshot::channel();
        let task_name = name.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    message = rx.recv() => match message {
                        Some(m) => callback(m).await,
                        None => break,
                    },
                }
            }
            debug!(connection = %task_name, "delivery task stopped");
            let _ = done_tx.send(rx);
        });

        *slot = Some(CallbackHandle { stop_tx, done_rx });
        debug!(connection = name, "callback bound");
        Ok(())
    }

    /// Unregister the delivery callback, waiting for the in-flight
    /// delivery (if any) to finish. No-op if none is bound.
    pub async fn remove_callback<T: Send + 'static>(
        &self,
        name: &str,
    ) -> Result<(), TransportError> {
        let conn = self.connection::<T>(name).await?;
        let handle = conn.callback.lock().await.take();
        let Some(handle) = handle else {
            return Ok(());
        };
        let _ = handle.stop_tx.send(true);
        match handle.done_rx.await {
            Ok(rx) => *conn.rx.lock().await = Some(rx),
            Err(_) => warn!(connection = name, "delivery task lost its stream"),
        }
        debug!(connection = name, "callback removed");
        Ok(())
    }
}
