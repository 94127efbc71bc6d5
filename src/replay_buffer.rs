use ndarray::Array1;
use rand::seq::SliceRandom;
use rand::{thread_rng, Rng};
use std::collections::VecDeque;

#[derive(Clone, Debug, PartialEq)]
pub struct Experience {
    pub state: Array1<f32>,
    pub action: usize,
    pub reward: f32,
    pub next_state: Array1<f32>,
    pub done: bool,
}

#[derive(Clone)]
pub struct ReplayBuffer {
    buffer: VecDeque<Experience>,
    capacity: usize,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        ReplayBuffer {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn add(&mut self, experience: Experience) {
        if self.buffer.len() == self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(experience);
    }

    pub fn sample(&self, batch_size: usize) -> Vec<&Experience> {
        let mut rng = thread_rng();
        let mut indices = (0..self.buffer.len()).collect::<Vec<usize>>();
        indices.shuffle(&mut rng);
        indices.truncate(batch_size);
        indices.into_iter().map(|i| &self.buffer[i]).collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Replay storage for recurrent agents: keeps whole episodes so that
/// contiguous traces can be drawn from them.
///
/// The episode currently being filled also counts as a sampling candidate,
/// so training can start before the first episode terminates.
#[derive(Clone)]
pub struct EpisodeBuffer {
    episodes: VecDeque<Vec<Experience>>,
    current: Vec<Experience>,
    capacity: usize,
    stored_steps: usize,
}

impl EpisodeBuffer {
    /// `capacity` bounds the total number of stored steps across completed
    /// episodes; the oldest episodes are evicted whole.
    pub fn new(capacity: usize) -> Self {
        EpisodeBuffer {
            episodes: VecDeque::new(),
            current: Vec::new(),
            capacity,
            stored_steps: 0,
        }
    }

    pub fn push(&mut self, experience: Experience) {
        let done = experience.done;
        self.current.push(experience);
        if done {
            self.end_episode();
        }
    }

    pub fn end_episode(&mut self) {
        if self.current.is_empty() {
            return;
        }
        let episode = std::mem::take(&mut self.current);
        self.stored_steps += episode.len();
        self.episodes.push_back(episode);
        while self.stored_steps > self.capacity {
            match self.episodes.pop_front() {
                Some(old) => self.stored_steps -= old.len(),
                None => break,
            }
        }
    }

    /// Total steps currently stored, the open episode included.
    pub fn len(&self) -> usize {
        self.stored_steps + self.current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether at least one stored episode can yield a trace of this length.
    pub fn has_trace(&self, trace_len: usize) -> bool {
        self.current.len() >= trace_len || self.episodes.iter().any(|e| e.len() >= trace_len)
    }

    /// Draw `batch_size` contiguous traces of exactly `trace_len` steps,
    /// with replacement. Returns an empty vector when no episode is long enough.
    pub fn sample_traces(&self, batch_size: usize, trace_len: usize) -> Vec<&[Experience]> {
        let candidates: Vec<&[Experience]> = self
            .episodes
            .iter()
            .map(|e| e.as_slice())
            .chain(std::iter::once(self.current.as_slice()))
            .filter(|e| e.len() >= trace_len)
            .collect();
        if candidates.is_empty() {
            return Vec::new();
        }

        let mut rng = thread_rng();
        (0..batch_size)
            .map(|_| {
                let episode = candidates[rng.gen_range(0..candidates.len())];
                let start = rng.gen_range(0..=episode.len() - trace_len);
                &episode[start..start + trace_len]
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn exp(tag: f32, done: bool) -> Experience {
        Experience {
            state: array![tag],
            action: 0,
            reward: tag,
            next_state: array![tag + 1.0],
            done,
        }
    }

    #[test]
    fn test_replay_buffer_capacity_evicts_oldest() {
        let mut buffer = ReplayBuffer::new(3);
        for i in 0..5 {
            buffer.add(exp(i as f32, false));
        }
        assert_eq!(buffer.len(), 3);
        let rewards: Vec<f32> = buffer.sample(3).iter().map(|e| e.reward).collect();
        assert!(rewards.iter().all(|&r| r >= 2.0));
    }

    #[test]
    fn test_replay_buffer_sample_size() {
        let mut buffer = ReplayBuffer::new(10);
        for i in 0..4 {
            buffer.add(exp(i as f32, false));
        }
        assert_eq!(buffer.sample(2).len(), 2);
        // asking for more than stored returns what is there
        assert_eq!(buffer.sample(100).len(), 4);
    }

    #[test]
    fn test_episode_buffer_traces_are_contiguous() {
        let mut buffer = EpisodeBuffer::new(100);
        for i in 0..10 {
            buffer.push(exp(i as f32, i == 9));
        }
        let traces = buffer.sample_traces(5, 4);
        assert_eq!(traces.len(), 5);
        for trace in traces {
            assert_eq!(trace.len(), 4);
            for pair in trace.windows(2) {
                assert!((pair[1].reward - pair[0].reward - 1.0).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_episode_buffer_samples_open_episode() {
        let mut buffer = EpisodeBuffer::new(100);
        for i in 0..6 {
            buffer.push(exp(i as f32, false));
        }
        // nothing terminated yet, but the open episode is long enough
        assert!(buffer.has_trace(4));
        assert_eq!(buffer.sample_traces(2, 4).len(), 2);
        assert!(buffer.sample_traces(2, 10).is_empty());
    }

    #[test]
    fn test_episode_buffer_eviction_by_whole_episode() {
        let mut buffer = EpisodeBuffer::new(10);
        for episode in 0..4 {
            for i in 0..5 {
                buffer.push(exp((episode * 5 + i) as f32, i == 4));
            }
        }
        // 4 episodes of 5 steps with capacity 10 keeps the last two
        assert_eq!(buffer.len(), 10);
        let traces = buffer.sample_traces(20, 5);
        assert!(traces.iter().all(|t| t[0].reward >= 10.0));
    }
}
