//! Scripted in-memory adapter for tests and dry runs.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{AdapterError, HardwareAdapter};

/// Records every command and answers queries from scripted replies.
///
/// Replies are queued per command. A queue with one remaining entry keeps
/// returning it, so a polling loop ("what mode are you in?") can be scripted
/// as a finite sequence ending in the steady state. `on_contains` matches a
/// substring of the command, which is how JSON-RPC requests (whose bodies
/// carry a changing request id) are scripted by method name.
#[derive(Clone, Default)]
pub struct MockAdapter {
    connected: Arc<Mutex<bool>>,
    sent: Arc<Mutex<Vec<String>>>,
    exact: Arc<Mutex<HashMap<String, VecDeque<String>>>>,
    rules: Arc<Mutex<Vec<(String, VecDeque<String>)>>>,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for an exact (whitespace-trimmed) command.
    pub fn on(&self, command: &str, reply: &str) -> &Self {
        let mut exact = self.exact.lock().unwrap();
        exact
            .entry(command.to_string())
            .or_default()
            .push_back(reply.to_string());
        self
    }

    /// Queue a reply for any command containing `pattern`.
    pub fn on_contains(&self, pattern: &str, reply: &str) -> &Self {
        let mut rules = self.rules.lock().unwrap();
        if let Some((_, queue)) = rules.iter_mut().find(|(p, _)| p == pattern) {
            queue.push_back(reply.to_string());
        } else {
            let mut queue = VecDeque::new();
            queue.push_back(reply.to_string());
            rules.push((pattern.to_string(), queue));
        }
        self
    }

    /// Snapshot of every command sent so far, trimmed of line terminators.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }

    fn record(&self, command: &str) {
        self.sent
            .lock()
            .unwrap()
            .push(command.trim_end_matches(['\r', '\n']).to_string());
    }

    fn pop(queue: &mut VecDeque<String>) -> Option<String> {
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }

    fn reply_for(&self, command: &str) -> Option<String> {
        let key = command.trim_end_matches(['\r', '\n']);
        if let Some(queue) = self.exact.lock().unwrap().get_mut(key) {
            if let Some(reply) = Self::pop(queue) {
                return Some(reply);
            }
        }
        let mut rules = self.rules.lock().unwrap();
        for (pattern, queue) in rules.iter_mut() {
            if key.contains(pattern.as_str()) {
                if let Some(reply) = Self::pop(queue) {
                    return Some(reply);
                }
            }
        }
        None
    }
}

#[async_trait]
impl HardwareAdapter for MockAdapter {
    fn name(&self) -> &str {
        "mock"
    }

    fn default_config(&self) -> Value {
        json!({})
    }

    fn validate_config(&self, _config: &Value) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn connect(&mut self, _config: &Value) -> Result<(), AdapterError> {
        *self.connected.lock().unwrap() = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), AdapterError> {
        *self.connected.lock().unwrap() = false;
        Ok(())
    }

    async fn send(&mut self, command: &str) -> Result<(), AdapterError> {
        if !*self.connected.lock().unwrap() {
            return Err(AdapterError::NotConnected);
        }
        self.record(command);
        Ok(())
    }

    async fn query(&mut self, command: &str) -> Result<String, AdapterError> {
        if !*self.connected.lock().unwrap() {
            return Err(AdapterError::NotConnected);
        }
        self.record(command);
        self.reply_for(command).ok_or_else(|| {
            AdapterError::CommunicationError(format!(
                "no scripted reply for '{}'",
                command.trim_end()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_queued_then_sticks_on_last() {
        let mock = MockAdapter::new();
        mock.on("MODE?", "idle").on("MODE?", "running");
        let mut adapter = mock.clone();
        adapter.connect(&json!({})).await.unwrap();

        assert_eq!(adapter.query("MODE?\r").await.unwrap(), "idle");
        assert_eq!(adapter.query("MODE?\r").await.unwrap(), "running");
        // Last entry is sticky.
        assert_eq!(adapter.query("MODE?\r").await.unwrap(), "running");
    }

    #[tokio::test]
    async fn substring_rules_match_rpc_bodies() {
        let mock = MockAdapter::new();
        mock.on_contains("getCurrentMode", "{\"result\":[\"system idle\"]}");
        let mut adapter = mock.clone();
        adapter.connect(&json!({})).await.unwrap();

        let reply = adapter
            .query("{\"id\":7,\"method\":\"com.attocube.ids.system.getCurrentMode\"}")
            .await
            .unwrap();
        assert!(reply.contains("system idle"));
    }

    #[tokio::test]
    async fn errors_when_disconnected_or_unscripted() {
        let mut adapter = MockAdapter::new();
        assert!(matches!(
            adapter.send("VE?").await,
            Err(AdapterError::NotConnected)
        ));
        adapter.connect(&json!({})).await.unwrap();
        assert!(matches!(
            adapter.query("VE?").await,
            Err(AdapterError::CommunicationError(_))
        ));
    }
}
