//! A ZMQ subscriber for asserting on published notifications.

use std::time::Duration;

use serde_json::Value;

/// Subscriber connected to a publisher under test.  Received messages are
/// parsed into `(topic, payload, seq)` triples.
pub struct TestSubscriber {
    sock: zmq::Socket,
}

impl TestSubscriber {
    /// Connects to the given publisher endpoint, subscribed to everything.
    pub fn connect(endpoint: &str) -> Self {
        let ctx = zmq::Context::new();
        let sock = ctx.socket(zmq::SUB).expect("failed to create SUB socket");
        sock.set_subscribe(b"").expect("failed to subscribe");
        sock.connect(endpoint).expect("failed to connect subscriber");

        // PUB/SUB joins are asynchronous; messages published before the
        // subscription is established would be lost.
        std::thread::sleep(Duration::from_millis(100));

        Self { sock }
    }

    /// Receives the next message, waiting up to a second for it.
    pub fn recv(&self) -> Option<(String, Value, u32)> {
        self.recv_with_timeout(Duration::from_secs(1))
    }

    /// Checks for an already queued (or imminent) message without the full
    /// receive timeout.  Used to assert that nothing more was published.
    pub fn try_recv(&self) -> Option<(String, Value, u32)> {
        self.recv_with_timeout(Duration::from_millis(100))
    }

    fn recv_with_timeout(&self, timeout: Duration) -> Option<(String, Value, u32)> {
        self.sock
            .set_rcvtimeo(timeout.as_millis() as i32)
            .expect("failed to set receive timeout");

        let parts = match self.sock.recv_multipart(0) {
            Ok(parts) => parts,
            Err(zmq::Error::EAGAIN) => return None,
            Err(err) => panic!("ZMQ receive failed: {err}"),
        };
        assert_eq!(parts.len(), 3, "expected a three-frame message");

        let topic = String::from_utf8(parts[0].clone()).expect("topic is not UTF-8");
        let payload = serde_json::from_slice(&parts[1]).expect("payload is not JSON");
        let seq_bytes: [u8; 4] = parts[2][..].try_into().expect("seq frame is not 4 bytes");

        Some((topic, payload, u32::from_le_bytes(seq_bytes)))
    }
}
