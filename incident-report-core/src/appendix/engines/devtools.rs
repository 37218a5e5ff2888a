//! DevTools protocol client for Chromium's `--remote-debugging-pipe`.
//!
//! Both directions carry JSON messages terminated by a NUL byte. Replies are
//! matched to calls by id; events are read and dropped.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

type Reply = Result<Value, String>;
type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

pub(crate) struct DevToolsConnection {
    writer: AsyncMutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: Pending,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl DevToolsConnection {
    /// Start reading replies in the background. Must be called inside a tokio runtime.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending = Pending::default();
        let alive = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_replies(reader, pending.clone(), alive.clone()));
        Self {
            writer: AsyncMutex::new(Box::new(writer)),
            pending,
            next_id: AtomicU64::new(1),
            alive,
            reader,
        }
    }

    /// False once the browser side closed its end
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Send one command and wait for its reply. `session_id` targets an attached page.
    pub async fn call(&self, session_id: Option<&str>, method: &str, params: Value) -> Reply {
        if !self.is_alive() {
            return Err(format!("browser connection is closed, cannot send {method}"));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|_| "pending call table is poisoned".to_string())?
            .insert(id, tx);
        // The reader clears the table after marking the connection dead
        if !self.is_alive() {
            self.forget(id);
            return Err(format!("browser connection closed before {method}"));
        }

        let mut message = json!({ "id": id, "method": method, "params": params });
        if let Some(session_id) = session_id {
            message["sessionId"] = json!(session_id);
        }
        let mut bytes = serde_json::to_vec(&message).map_err(|e| e.to_string())?;
        bytes.push(0);

        let sent = {
            let mut writer = self.writer.lock().await;
            match writer.write_all(&bytes).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = sent {
            self.forget(id);
            self.alive.store(false, Ordering::SeqCst);
            return Err(format!("could not send {method}: {e}"));
        }

        match rx.await {
            Ok(reply) => reply,
            Err(_) => Err(format!("browser closed the connection during {method}")),
        }
    }

    fn forget(&self, id: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&id);
        }
    }
}

impl Drop for DevToolsConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_replies<R: AsyncRead + Unpin>(reader: R, pending: Pending, alive: Arc<AtomicBool>) {
    let mut reader = BufReader::new(reader);
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        match reader.read_until(0, &mut buffer).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                log::warn!("⚠️  DevTools pipe read failed: {}", e);
                break;
            }
        }
        if buffer.last() == Some(&0) {
            buffer.pop();
        }

        let message: Value = match serde_json::from_slice(&buffer) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("⚠️  Unreadable DevTools message ({} bytes): {}", buffer.len(), e);
                continue;
            }
        };
        let Some(id) = message.get("id").and_then(Value::as_u64) else {
            continue;
        };
        let reply = match message.get("error") {
            Some(error) => Err(error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown DevTools error")
                .to_string()),
            None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
        };
        let waiter = pending.lock().ok().and_then(|mut pending| pending.remove(&id));
        if let Some(waiter) = waiter {
            let _ = waiter.send(reply);
        }
    }

    alive.store(false, Ordering::SeqCst);
    // Dropping the senders wakes every caller still waiting
    if let Ok(mut pending) = pending.lock() {
        pending.clear();
    }
}
