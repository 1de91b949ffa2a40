use super::{Message, Transport};
use crate::Result;
use async_trait::async_trait;
use std::io::Write;
use std::sync::Arc;

/// Debug transport that pretty-prints each message to stdout and always acks.
pub struct ConsoleTransport {
    destination: String,
}

impl ConsoleTransport {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
        }
    }

    fn render(message: &Message) -> String {
        match serde_json::from_slice::<serde_json::Value>(&message.payload) {
            Ok(value) => serde_json::to_string_pretty(&value)
                .unwrap_or_else(|_| String::from_utf8_lossy(&message.payload).into_owned()),
            Err(_) => String::from_utf8_lossy(&message.payload).into_owned(),
        }
    }
}

#[async_trait]
impl Transport for ConsoleTransport {
    fn destination(&self) -> &str {
        &self.destination
    }

    async fn create(&self, destination: &str) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(ConsoleTransport::new(destination)))
    }

    async fn publish_batch(&self, messages: Vec<Message>) -> Result<()> {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        for message in &messages {
            // Output is best-effort; a closed stdout must not fail the batch.
            let _ = writeln!(
                out,
                "[{}] key={} {}",
                self.destination,
                message.key.as_deref().unwrap_or("-"),
                Self::render(message)
            );
        }
        let _ = out.flush();
        Ok(())
    }

    async fn ensure_destination_exists(&self, _destination: &str) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_pretty_prints_json() {
        let message = Message::new(None, br#"{"a":1}"#.to_vec());
        assert_eq!(ConsoleTransport::render(&message), "{\n  \"a\": 1\n}");
        let raw = Message::new(None, b"plain".to_vec());
        assert_eq!(ConsoleTransport::render(&raw), "plain");
    }

    #[tokio::test]
    async fn test_always_acks() {
        let transport = ConsoleTransport::new("ingest-queue");
        transport
            .publish_batch(vec![Message::new(Some("Persons".into()), b"{}".to_vec())])
            .await
            .unwrap();
        let sibling = transport.create("h.db.persons.events").await.unwrap();
        assert_eq!(sibling.destination(), "h.db.persons.events");
    }
}
