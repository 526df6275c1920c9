//! Tokenization dispatcher.
//!
//! One loop per listening channel:
//! wait for a frame, validate it, decode the text, tokenize, encode the reply
//! with swapped addressing, send, repeat.
//!
//! Frames for other protocols or ports share the wire with us and are dropped
//! silently. A tokenizer failure still produces a reply, with an empty
//! payload, so clients see a fast answer rather than a timeout. Send failures
//! are logged and the loop carries on; only a receive failure on the channel
//! ends the loop.

use crate::link::{Link, LinkError};
use crate::protocol::{self, Frame};
use crate::tokenizer::{TokenizeError, Tokenizer};
use bytes::Bytes;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// How often the loop wakes up to check for shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Counters for frames that reached the tokenizer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Replies sent, including empty ones
    pub replied: u64,
    /// Requests answered with an empty payload after a tokenizer failure
    pub tokenizer_errors: u64,
    /// Replies cut short to fit the link MTU
    pub truncated: u64,
    /// Replies that could not be sent
    pub send_errors: u64,
}

/// Dispatcher instance
pub struct Dispatcher {
    tokenizer: Arc<dyn Tokenizer>,
    protocol_id: u16,
    service_port: u16,
    max_payload: usize,
    stats: DispatchStats,
}

impl Dispatcher {
    /// Create a dispatcher answering `service_port` frames of `protocol_id`.
    ///
    /// Replies never carry more than `max_payload` bytes of text.
    pub fn new(
        tokenizer: Arc<dyn Tokenizer>,
        protocol_id: u16,
        service_port: u16,
        max_payload: usize,
    ) -> Self {
        Self {
            tokenizer,
            protocol_id,
            service_port,
            max_payload: max_payload.min(protocol::MAX_PAYLOAD_LEN),
            stats: DispatchStats::default(),
        }
    }

    #[cfg(test)]
    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Serve until `shutdown` is set or the channel fails.
    pub fn run<L: Link + ?Sized>(
        &mut self,
        link: &mut L,
        shutdown: &AtomicBool,
    ) -> Result<DispatchStats, LinkError> {
        info!(
            service_port = self.service_port,
            protocol_id = %format_args!("{:#06x}", self.protocol_id),
            "Dispatcher waiting for frames"
        );

        while !shutdown.load(Ordering::Relaxed) {
            let raw = match link.recv(POLL_INTERVAL) {
                Ok(raw) => raw,
                Err(LinkError::Timeout(_)) => continue,
                Err(e) => {
                    error!(error = %e, "Channel failed, stopping dispatcher");
                    return Err(e);
                }
            };

            let Some(reply) = self.handle_frame(&raw) else {
                continue;
            };

            match link.send(&reply) {
                Ok(()) => self.stats.replied += 1,
                Err(e) => {
                    self.stats.send_errors += 1;
                    warn!(error = %e, "Failed to send reply");
                }
            }
        }

        info!(
            replied = self.stats.replied,
            tokenizer_errors = self.stats.tokenizer_errors,
            send_errors = self.stats.send_errors,
            "Dispatcher stopped"
        );
        Ok(self.stats)
    }

    /// Process one inbound frame, returning the reply to send, if any.
    ///
    /// Frames that are not requests for this service yield `None` and leave
    /// the dispatcher untouched.
    pub fn handle_frame(&mut self, raw: &[u8]) -> Option<Bytes> {
        let frame = self.validate(raw)?;
        if frame.payload.is_empty() {
            trace!(src = %frame.src, "Dropping request with empty payload");
            return None;
        }
        trace!(src = %frame.src, src_port = frame.src_port(), text = %frame.payload, "Received request");

        let reply = match self.invoke_tokenizer(&frame.payload) {
            Ok(ids) => self.render_ids(&ids),
            Err(e) => {
                self.stats.tokenizer_errors += 1;
                warn!(error = %e, src = %frame.src, "Tokenizer failed, sending empty reply");
                String::new()
            }
        };
        trace!(tokens = %reply, "Tokenized request");

        Some(frame.reply(&reply))
    }

    fn validate(&self, raw: &[u8]) -> Option<Frame> {
        // Most traffic on a shared segment is not ours; skip it before decoding.
        if protocol::peek_protocol_id(raw) != Some(self.protocol_id) {
            return None;
        }
        let frame = match protocol::decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                trace!(error = %e, "Dropping frame");
                return None;
            }
        };
        if frame.protocol_id != self.protocol_id || frame.dst_port() != self.service_port {
            trace!(
                protocol_id = frame.protocol_id,
                dst_port = frame.dst_port(),
                "Dropping frame for another service"
            );
            return None;
        }
        Some(frame)
    }

    fn invoke_tokenizer(&self, text: &str) -> Result<Vec<u32>, TokenizeError> {
        let tokenizer = &self.tokenizer;
        match panic::catch_unwind(AssertUnwindSafe(|| tokenizer.tokenize(text))) {
            Ok(result) => result,
            Err(payload) => {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(TokenizeError::Panicked(msg))
            }
        }
    }

    /// Space-join ids, keeping only whole ids that fit `max_payload`.
    fn render_ids(&mut self, ids: &[u32]) -> String {
        let mut out = String::with_capacity(ids.len() * 6);
        for (i, id) in ids.iter().enumerate() {
            let id = id.to_string();
            let sep = usize::from(i > 0);
            if out.len() + sep + id.len() > self.max_payload {
                self.stats.truncated += 1;
                debug!(
                    kept = i,
                    total = ids.len(),
                    max_payload = self.max_payload,
                    "Reply truncated to fit MTU"
                );
                break;
            }
            if sep == 1 {
                out.push(' ');
            }
            out.push_str(&id);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::wire::Wire;
    use crate::protocol::{encode, MacAddr, DEFAULT_PROTOCOL_ID};

    const CLIENT: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x01]);
    const SERVER: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x02]);

    /// Replies with `0..n` for an `n`-word request.
    struct IndexTokenizer;

    impl Tokenizer for IndexTokenizer {
        fn tokenize(&self, text: &str) -> Result<Vec<u32>, TokenizeError> {
            Ok((0..text.split_whitespace().count() as u32).collect())
        }
    }

    struct FailingTokenizer;

    impl Tokenizer for FailingTokenizer {
        fn tokenize(&self, text: &str) -> Result<Vec<u32>, TokenizeError> {
            Err(TokenizeError::UnknownWord(text.to_string()))
        }
    }

    struct PanickingTokenizer;

    impl Tokenizer for PanickingTokenizer {
        fn tokenize(&self, _text: &str) -> Result<Vec<u32>, TokenizeError> {
            panic!("model crashed")
        }
    }

    fn dispatcher(tokenizer: Arc<dyn Tokenizer>) -> Dispatcher {
        Dispatcher::new(tokenizer, DEFAULT_PROTOCOL_ID, 67, 1478)
    }

    fn request(protocol_id: u16, dst_port: u16, text: &str) -> Bytes {
        encode(CLIENT, SERVER, protocol_id, 12345, dst_port, text)
    }

    #[test]
    fn test_reply_swaps_addressing() {
        let mut d = dispatcher(Arc::new(IndexTokenizer));
        let reply = d.handle_frame(&request(DEFAULT_PROTOCOL_ID, 67, "ab cd ef")).unwrap();
        let reply = protocol::decode(&reply).unwrap();
        assert_eq!(reply.src, SERVER);
        assert_eq!(reply.dst, CLIENT);
        assert_eq!(reply.src_port(), 67);
        assert_eq!(reply.dst_port(), 12345);
        assert_eq!(reply.payload, "0 1 2");
    }

    #[test]
    fn test_wrong_protocol_id_ignored() {
        let mut d = dispatcher(Arc::new(IndexTokenizer));
        let before = d.stats();
        assert!(d.handle_frame(&request(0x0800, 67, "ab cd")).is_none());
        assert_eq!(d.stats(), before);
    }

    #[test]
    fn test_wrong_port_and_short_frames_ignored() {
        let mut d = dispatcher(Arc::new(IndexTokenizer));
        assert!(d.handle_frame(&request(DEFAULT_PROTOCOL_ID, 68, "ab")).is_none());
        assert!(d.handle_frame(&[0u8; 10]).is_none());
        assert!(d.handle_frame(&request(DEFAULT_PROTOCOL_ID, 67, "")).is_none());
        assert_eq!(d.stats(), DispatchStats::default());
    }

    #[test]
    fn test_tokenizer_error_yields_empty_reply() {
        let mut d = dispatcher(Arc::new(FailingTokenizer));
        let reply = d.handle_frame(&request(DEFAULT_PROTOCOL_ID, 67, "ab")).unwrap();
        assert_eq!(protocol::decode(&reply).unwrap().payload, "");
        assert_eq!(d.stats().tokenizer_errors, 1);
    }

    #[test]
    fn test_tokenizer_panic_yields_empty_reply() {
        let mut d = dispatcher(Arc::new(PanickingTokenizer));
        let reply = d.handle_frame(&request(DEFAULT_PROTOCOL_ID, 67, "ab")).unwrap();
        assert_eq!(protocol::decode(&reply).unwrap().payload, "");
        assert_eq!(d.stats().tokenizer_errors, 1);
    }

    #[test]
    fn test_reply_truncated_to_whole_ids() {
        let mut d = Dispatcher::new(Arc::new(IndexTokenizer), DEFAULT_PROTOCOL_ID, 67, 10);
        let text = vec!["w"; 20].join(" ");
        let reply = d.handle_frame(&request(DEFAULT_PROTOCOL_ID, 67, &text)).unwrap();
        // "0 1 2 3 4" is 9 bytes; adding " 5" would exceed 10
        assert_eq!(protocol::decode(&reply).unwrap().payload, "0 1 2 3 4");
        assert_eq!(d.stats().truncated, 1);
    }

    #[test]
    fn test_run_serves_until_shutdown() {
        let wire = Wire::new();
        let mut server_end = wire.attach();
        let mut client = wire.attach();
        let shutdown = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&shutdown);
        let handle = std::thread::spawn(move || {
            dispatcher(Arc::new(IndexTokenizer)).run(&mut server_end, &flag)
        });

        client.send(&request(0x0800, 67, "noise")).unwrap();
        client.send(&request(DEFAULT_PROTOCOL_ID, 67, "ab cd")).unwrap();
        let reply = client.recv(Duration::from_secs(2)).unwrap();
        assert_eq!(protocol::decode(&reply).unwrap().payload, "0 1");

        shutdown.store(true, Ordering::Relaxed);
        let stats = handle.join().unwrap().unwrap();
        assert_eq!(stats.replied, 1);
    }

    #[test]
    fn test_run_stops_on_channel_failure() {
        let wire = Wire::new();
        let mut server_end = wire.attach();
        server_end.close();
        let shutdown = AtomicBool::new(false);
        let result = dispatcher(Arc::new(IndexTokenizer)).run(&mut server_end, &shutdown);
        assert!(matches!(result, Err(LinkError::Closed)));
    }
}
