use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::transport::{TcpChannel, TrafficType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerScoringConfig {
    /// Outstanding bootstrap requests allowed per channel.
    pub channel_limit: usize,
}

impl Default for PeerScoringConfig {
    fn default() -> Self {
        Self { channel_limit: 16 }
    }
}

struct PeerScore {
    channel: Weak<TcpChannel>,
    outstanding: usize,
    request_count_total: u64,
    response_count_total: u64,
}

impl PeerScore {
    fn decay(&mut self) {
        self.outstanding /= 2;
    }
}

/// Tracks in-flight bootstrap requests per channel, keyed by channel
/// identity. Non-owning: dead channels are dropped on `timeout()`.
pub struct PeerScoring {
    config: PeerScoringConfig,
    scoring: HashMap<usize, PeerScore>,
    channels: Vec<Arc<TcpChannel>>,
}

fn channel_key(channel: &Arc<TcpChannel>) -> usize {
    Arc::as_ptr(channel) as usize
}

impl PeerScoring {
    pub fn new(config: PeerScoringConfig) -> Self {
        Self {
            config,
            scoring: HashMap::new(),
            channels: Vec::new(),
        }
    }

    pub fn limit_exceeded(&self, channel: &Arc<TcpChannel>) -> bool {
        match self.scoring.get(&channel_key(channel)) {
            Some(score) => score.outstanding >= self.config.channel_limit,
            None => false,
        }
    }

    /// Returns true iff the channel is already at its limit; otherwise the
    /// outstanding count is incremented.
    pub fn try_send_message(&mut self, channel: &Arc<TcpChannel>) -> bool {
        match self.scoring.get_mut(&channel_key(channel)) {
            Some(score) => {
                if score.outstanding < self.config.channel_limit {
                    score.outstanding += 1;
                    score.request_count_total += 1;
                } else {
                    return true;
                }
            }
            None => {
                self.scoring.insert(
                    channel_key(channel),
                    PeerScore {
                        channel: Arc::downgrade(channel),
                        outstanding: 1,
                        request_count_total: 1,
                        response_count_total: 0,
                    },
                );
            }
        }
        false
    }

    pub fn received_message(&mut self, channel: &Arc<TcpChannel>) {
        if let Some(score) = self.scoring.get_mut(&channel_key(channel)) {
            if score.outstanding > 1 {
                score.outstanding -= 1;
                score.response_count_total += 1;
            }
        }
    }

    /// First known-alive channel below the traffic soft cap that accepts
    /// another request.
    pub fn channel(&mut self) -> Option<Arc<TcpChannel>> {
        let candidates: Vec<Arc<TcpChannel>> = self.channels.to_vec();
        for channel in candidates {
            if !channel.max(TrafficType::Bootstrap) && !self.try_send_message(&channel) {
                return Some(channel);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.scoring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scoring.is_empty()
    }

    pub fn available(&self) -> usize {
        self.channels
            .iter()
            .filter(|channel| !self.limit_exceeded(channel))
            .count()
    }

    /// Drops scores for dead channels and decays the rest.
    pub fn timeout(&mut self) {
        self.scoring.retain(|_, score| {
            score
                .channel
                .upgrade()
                .map(|channel| channel.alive())
                .unwrap_or(false)
        });
        for score in self.scoring.values_mut() {
            score.decay();
        }
    }

    /// Replaces the candidate channel list.
    pub fn sync(&mut self, channels: Vec<Arc<TcpChannel>>) {
        self.channels = channels;
    }
}
