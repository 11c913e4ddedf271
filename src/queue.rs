//! The deduplicating command queue that serializes every outbound,
//! state-changing SOAP action to one renderer.

use std::mem::discriminant;

use crate::model::MediaType;

/// Media to hand to `SetAVTransportURI`/`SetNextAVTransportURI`.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaData {
    pub url: String,
    pub content_features: String,
    pub metadata: String,
    pub media_type: MediaType,
    pub reset_playback: bool,
    pub position_ticks: i64,
    /// Byte-for-byte seekable on the renderer. A transcode's URL encodes
    /// its start offset, so a same-item dispatch can never collapse into
    /// a renderer-side `Seek`; it must always `SetAVTransportURI`.
    pub is_direct_stream: bool,
}

/// One outbound, state-changing renderer command. Variants with a payload
/// still dedup on kind alone (see [`CommandQueue::enqueue`]); only the
/// newest payload survives.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetVolume(i32),
    Mute,
    Unmute,
    ToggleMute,
    Play,
    Pause,
    Stop,
    Seek(i64),
    Queue(MediaData),
    QueueNext(MediaData),
}

/// FIFO of pending commands with kind-based deduplication. The sole
/// serialization point for outbound state-changing requests to one
/// renderer: the queue worker pops and dispatches one entry at a time.
#[derive(Debug, Clone, Default)]
pub struct CommandQueue {
    entries: Vec<Command>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub fn entries(&self) -> &[Command] {
        &self.entries
    }

    /// Enqueues a command. Same-kind entries coalesce: the earlier one is
    /// dropped and the new one appended, except `ToggleMute`, where the
    /// second of a rapid pair instead cancels the first (two toggles are a
    /// no-op).
    pub fn enqueue(&mut self, command: Command) {
        if matches!(command, Command::ToggleMute) {
            if let Some(pos) = self.entries.iter().position(|c| matches!(c, Command::ToggleMute)) {
                self.entries.remove(pos);
                return;
            }
            self.entries.push(command);
            return;
        }

        if let Some(pos) = self
            .entries
            .iter()
            .position(|c| discriminant(c) == discriminant(&command))
        {
            self.entries.remove(pos);
        }
        self.entries.push(command);
    }

    /// Pops the oldest pending command, if any.
    pub fn pop(&mut self) -> Option<Command> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media(url: &str) -> MediaData {
        MediaData {
            url: url.to_string(),
            content_features: String::new(),
            metadata: String::new(),
            media_type: MediaType::Video,
            reset_playback: false,
            position_ticks: 0,
            is_direct_stream: true,
        }
    }

    #[test]
    fn test_enqueue_deduplicates_same_kind() {
        let mut queue = CommandQueue::new();
        queue.enqueue(Command::SetVolume(10));
        queue.enqueue(Command::SetVolume(20));
        queue.enqueue(Command::SetVolume(30));
        queue.enqueue(Command::SetVolume(40));

        assert_eq!(1, queue.len());
        assert_eq!(Some(&Command::SetVolume(40)), queue.entries().first());
    }

    #[test]
    fn test_enqueue_never_holds_two_of_the_same_kind() {
        let mut queue = CommandQueue::new();
        queue.enqueue(Command::Play);
        queue.enqueue(Command::SetVolume(1));
        queue.enqueue(Command::Play);

        assert_eq!(2, queue.len());
        let play_count = queue.entries().iter().filter(|c| matches!(c, Command::Play)).count();
        assert_eq!(1, play_count);
    }

    #[test]
    fn test_rapid_toggle_mute_pair_cancels() {
        let mut queue = CommandQueue::new();
        queue.enqueue(Command::ToggleMute);
        queue.enqueue(Command::ToggleMute);

        assert_eq!(0, queue.len());
    }

    #[test]
    fn test_queue_and_queue_next_are_distinct_kinds() {
        let mut queue = CommandQueue::new();
        queue.enqueue(Command::Queue(media("a")));
        queue.enqueue(Command::QueueNext(media("b")));

        assert_eq!(2, queue.len());
    }

    #[test]
    fn test_pop_is_fifo() {
        let mut queue = CommandQueue::new();
        queue.enqueue(Command::Play);
        queue.enqueue(Command::Pause);

        assert_eq!(Some(Command::Play), queue.pop());
        assert_eq!(Some(Command::Pause), queue.pop());
        assert_eq!(None, queue.pop());
    }
}
