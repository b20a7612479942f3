//! Multiplexes the three response args into frame parts.
//!
//! Each frame carries the pending bytes of the first open arg, then of every
//! following arg as long as the previous one has ended. The first part of a
//! frame continues the arg the previous frame stopped in.

use std::mem;

use bytes::Bytes;

use crate::errors::ChannelError;

const ARG_COUNT: usize = 3;

#[derive(Debug, Default)]
pub struct OutArgStream {
    pending: [Vec<u8>; ARG_COUNT],
    ended: [bool; ARG_COUNT],
    current: usize,
    dirty: bool,
    finished: bool,
}

impl OutArgStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to arg `index` (0-based). Writing an arg ends all earlier ones.
    pub fn write(&mut self, index: usize, chunk: &[u8]) -> Result<(), ChannelError> {
        if self.finished || index >= ARG_COUNT || self.ended[index] {
            return Err(ChannelError::ResponseFrameState {
                attempted: format!("write arg{}", index + 1),
                state: "ended".into(),
            });
        }
        for ended in &mut self.ended[..index] {
            *ended = true;
        }
        self.pending[index].extend_from_slice(chunk);
        self.dirty = true;
        Ok(())
    }

    /// End arg `index` and every arg before it.
    pub fn end(&mut self, index: usize) {
        if self.finished {
            return;
        }
        let last = index.min(ARG_COUNT - 1);
        for ended in &mut self.ended[..=last] {
            *ended = true;
        }
        self.dirty = true;
    }

    pub fn is_ended(&self, index: usize) -> bool {
        self.ended.get(index).copied().unwrap_or(true)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Parts for the next frame and whether it is the last one; `None` when
    /// nothing changed since the previous frame.
    pub fn take_frame(&mut self) -> Option<(Vec<Bytes>, bool)> {
        if self.finished || !self.dirty {
            return None;
        }
        self.dirty = false;

        let mut parts = Vec::new();
        let mut index = self.current;
        while index < ARG_COUNT {
            parts.push(Bytes::from(mem::take(&mut self.pending[index])));
            if !self.ended[index] {
                break;
            }
            index += 1;
        }
        if index == ARG_COUNT {
            self.finished = true;
            return Some((parts, true));
        }
        self.current = index;
        Some((parts, false))
    }

    /// Terminate every arg without producing another frame.
    pub fn finish_all(&mut self) {
        self.ended = [true; ARG_COUNT];
        self.pending = Default::default();
        self.finished = true;
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(frame: &(Vec<Bytes>, bool)) -> Vec<Vec<u8>> {
        frame.0.iter().map(|b| b.to_vec()).collect()
    }

    #[test]
    fn frames_follow_arg_boundaries() {
        let mut args = OutArgStream::new();
        args.end(0);
        args.write(1, b"he").unwrap();
        let first = args.take_frame().unwrap();
        assert_eq!(parts(&first), vec![b"".to_vec(), b"he".to_vec()]);
        assert!(!first.1);

        args.write(1, b"ad").unwrap();
        args.write(2, b"bo").unwrap();
        let second = args.take_frame().unwrap();
        assert_eq!(parts(&second), vec![b"ad".to_vec(), b"bo".to_vec()]);

        args.write(2, b"dy").unwrap();
        args.end(2);
        let last = args.take_frame().unwrap();
        assert_eq!(parts(&last), vec![b"dy".to_vec()]);
        assert!(last.1);
        assert!(args.is_finished());
        assert!(args.take_frame().is_none());
    }

    #[test]
    fn nothing_new_means_no_frame() {
        let mut args = OutArgStream::new();
        assert!(args.take_frame().is_none());
        args.write(0, b"x").unwrap();
        assert!(args.take_frame().is_some());
        assert!(args.take_frame().is_none());
    }

    #[test]
    fn ended_args_reject_writes() {
        let mut args = OutArgStream::new();
        args.write(2, b"body").unwrap();
        assert!(args.is_ended(1));
        assert!(matches!(
            args.write(1, b"late"),
            Err(ChannelError::ResponseFrameState { .. })
        ));
    }

    #[test]
    fn finish_all_stops_output() {
        let mut args = OutArgStream::new();
        args.write(1, b"partial").unwrap();
        args.finish_all();
        assert!(args.take_frame().is_none());
        assert!(args.write(2, b"x").is_err());
    }
}
