//! Server-sent event framing.

use tracing::debug;

use super::RawEvent;

/// One dispatched SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

impl SseFrame {
    /// Decode the JSON envelope the product event stream sends.
    pub fn into_event(self) -> Option<RawEvent> {
        #[derive(serde::Deserialize)]
        struct Envelope {
            #[serde(default)]
            data: Option<String>,
            #[serde(default)]
            published_at: String,
            coreid: String,
        }

        match serde_json::from_str::<Envelope>(&self.data) {
            Ok(env) => Some(RawEvent {
                name: self.event,
                data: env.data.unwrap_or_default(),
                published_at: env.published_at,
                coreid: env.coreid,
            }),
            Err(e) => {
                debug!(event = %self.event, error = %e, "Skipping undecodable frame");
                None
            }
        }
    }
}

/// Incremental decoder; chunks may split lines anywhere.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    event: Option<String>,
    data: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(frame) = self.dispatch() {
                    frames.push(frame);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => match &mut self.data {
                    Some(data) => {
                        data.push('\n');
                        data.push_str(value);
                    }
                    None => self.data = Some(value.to_string()),
                },
                _ => {}
            }
        }
        frames
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        let data = self.data.take()?;
        Some(SseFrame {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_split_across_chunks() {
        let mut dec = SseDecoder::new();
        assert!(dec.feed(b":ok\n\nevent: spark/sta").is_empty());
        let frames = dec.feed(
            b"tus\r\ndata: {\"data\":\"online\",\"ttl\":60,\"published_at\":\"2024-01-01T00:00:00.000Z\",\"coreid\":\"d1\"}\r\n\r\n",
        );

        assert_eq!(frames.len(), 1);
        let ev = frames[0].clone().into_event().unwrap();
        assert_eq!(ev.name, "spark/status");
        assert_eq!(ev.data, "online");
        assert_eq!(ev.coreid, "d1");
    }

    #[test]
    fn test_event_without_data_is_not_dispatched() {
        let mut dec = SseDecoder::new();
        assert!(dec.feed(b"event: x\n\n").is_empty());
        let frames = dec.feed(b"data: a\ndata: b\n\n");
        assert_eq!(
            frames,
            vec![SseFrame {
                event: "message".into(),
                data: "a\nb".into()
            }]
        );
    }

    #[test]
    fn test_null_data_becomes_empty() {
        let frame = SseFrame {
            event: "spark/device/last_reset".into(),
            data: r#"{"data":null,"coreid":"d1"}"#.into(),
        };
        assert_eq!(frame.into_event().unwrap().data, "");
    }
}
