//! Synthetic message source for running without a live gateway session.

use chrono::{DateTime, Duration, Local};
use log::info;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

use crate::{
    client::{ClientError, FetchRequest, MessageSource},
    config::DEFAULT_CHAT_ID,
    types::{FetchResult, Message},
};

/// Upper bound on generated messages per fetch.
pub const MAX_MOCK_MESSAGES: usize = 20;

const SAMPLE_BODIES: &[&str] = &[
    "Halo, bagaimana kabarnya?",
    "Baik-baik saja, terima kasih!",
    "Apakah project sudah selesai?",
    "Sudah, tinggal testing final",
    "Oke, saya cek dulu ya",
    "Siap, saya tunggu update nya",
    "Documents sudah saya kirim",
    "Terima kasih atas bantuannya",
    "Sampai jumpa besok!",
    "Have a great day!",
];

/// Deterministic generator of gateway-shaped fetch results.
#[derive(Debug, Clone)]
pub struct MockSource {
    own_id: String,
    seed: Option<u64>,
    base_time: Option<DateTime<Local>>,
}

impl Default for MockSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSource {
    pub fn new() -> Self {
        Self {
            own_id: DEFAULT_CHAT_ID.to_string(),
            seed: None,
            base_time: None,
        }
    }

    /// Identity used for the account side of the conversation.
    pub fn with_own_id(mut self, own_id: impl Into<String>) -> Self {
        self.own_id = own_id.into();
        self
    }

    /// Fix the RNG seed instead of deriving it from the chat id.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Fix the newest message time instead of using the current time.
    pub fn with_base_time(mut self, base_time: DateTime<Local>) -> Self {
        self.base_time = Some(base_time);
        self
    }

    /// Generate up to [`MAX_MOCK_MESSAGES`] messages, newest first, two hours
    /// apart.
    pub fn generate(&self, request: &FetchRequest) -> FetchResult {
        let chat_id = request.chat_id.to_string();
        let now = Local::now();
        let base_time = self.base_time.unwrap_or(now);
        let mut rng = StdRng::seed_from_u64(self.seed.unwrap_or_else(|| seed_for(&chat_id)));
        let count = (request.limit as usize).min(MAX_MOCK_MESSAGES);

        let messages: Vec<Message> = (0..count)
            .map(|i| {
                let timestamp = (base_time - Duration::hours(2 * i as i64)).timestamp();
                let from_me = rng.gen_bool(0.5);
                let (from, to) = if from_me {
                    (self.own_id.clone(), chat_id.clone())
                } else {
                    (chat_id.clone(), self.own_id.clone())
                };
                let body = SAMPLE_BODIES
                    .choose(&mut rng)
                    .copied()
                    .unwrap_or_default()
                    .to_string();

                Message {
                    id: format!("mock_msg_{i}_{timestamp}"),
                    from,
                    to,
                    timestamp,
                    body: Some(body),
                    from_me,
                    has_media: false,
                    media: None,
                    ack: Some(rng.gen_range(1i64..=3).into()),
                    extra: Default::default(),
                }
            })
            .collect();

        FetchResult {
            total: messages.len(),
            has_more: messages.len() >= request.limit as usize,
            mock: true,
            retrieved_at: now,
            messages,
        }
    }
}

impl MessageSource for MockSource {
    fn fetch(&mut self, request: &FetchRequest) -> Result<FetchResult, ClientError> {
        info!("using mock data for {}", request.chat_id);
        Ok(self.generate(request))
    }
}

/// FNV-1a over the chat id, so each chat gets a stable stream.
fn seed_for(chat_id: &str) -> u64 {
    chat_id.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ byte as u64).wrapping_mul(0x0100_0000_01b3)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatId;
    use chrono::TimeZone;

    fn request(limit: u32) -> FetchRequest {
        FetchRequest::new(ChatId::user("628123456789")).with_limit(limit)
    }

    fn base() -> DateTime<Local> {
        Local.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_limit_ten_yields_ten() {
        let result = MockSource::new().generate(&request(10));
        assert_eq!(result.messages.len(), 10);
        assert_eq!(result.total, 10);
        assert!(result.mock);
        assert!(result.has_more);
    }

    #[test]
    fn test_capped_at_twenty() {
        let result = MockSource::new().generate(&request(100));
        assert_eq!(result.messages.len(), MAX_MOCK_MESSAGES);
        assert!(!result.has_more);
    }

    #[test]
    fn test_timestamps_step_back_two_hours() {
        let result = MockSource::new().with_base_time(base()).generate(&request(5));
        for (i, message) in result.messages.iter().enumerate() {
            assert_eq!(message.timestamp, 1_700_000_000 - 7200 * i as i64);
            assert_eq!(message.id, format!("mock_msg_{i}_{}", message.timestamp));
            assert!(message.sent_at().is_some());
        }
    }

    #[test]
    fn test_direction_matches_participants() {
        let result = MockSource::new().generate(&request(20));
        for message in &result.messages {
            if message.from_me {
                assert_eq!(message.from, DEFAULT_CHAT_ID);
                assert_eq!(message.to, "628123456789@c.us");
            } else {
                assert_eq!(message.from, "628123456789@c.us");
                assert_eq!(message.to, DEFAULT_CHAT_ID);
            }
            let ack = message.ack.as_ref().and_then(|a| a.as_i64()).unwrap();
            assert!((1..=3).contains(&ack));
        }
    }

    #[test]
    fn test_same_seed_same_output() {
        let source = MockSource::new().with_base_time(base());
        let first = source.generate(&request(8));
        let second = source.generate(&request(8));
        assert_eq!(first.messages, second.messages);
    }

    #[test]
    fn test_different_chats_get_different_seeds() {
        assert_ne!(seed_for("1@c.us"), seed_for("2@c.us"));
    }
}
