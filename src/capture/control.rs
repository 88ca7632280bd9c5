//! Command protocol spoken over the control bulk endpoints.

use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::capture::transport::ControlChannel;
use crate::{Result, TransportError};

pub const OUTBOUND_ENDPOINT: u8 = 0x02;
pub const INBOUND_ENDPOINT: u8 = 0x81;

pub const REQUEST_MAGIC: u32 = 0x0602_2009;
pub const RESPONSE_MAGIC: u32 = 0x0A6F_E000;

/// Upper bound on any data page the device returns.
pub const MAX_PAGE_SIZE: usize = 0x1C_0000;
const COMPLETION_WORDS: usize = 32;
const REQUEST_HEADER_SIZE: usize = 20;

/// Calibration pages readable with [`Command::ReadDataPage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataPage {
    P0Tables = 0x02,
    DepthParams = 0x03,
    ColorParams = 0x04,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    ReadDataPage(DataPage),
    SetStreaming(bool),
    StartDepth,
    StopDepth,
}

impl Command {
    pub fn code(self) -> u32 {
        match self {
            Command::ReadDataPage(_) => 0x22,
            Command::SetStreaming(_) => 0x2B,
            Command::StartDepth => 0x09,
            Command::StopDepth => 0x0A,
        }
    }

    fn param(self) -> Option<u32> {
        match self {
            Command::ReadDataPage(page) => Some(page as u32),
            Command::SetStreaming(on) => Some(u32::from(on)),
            Command::StartDepth | Command::StopDepth => None,
        }
    }

    fn max_response(self) -> usize {
        match self {
            Command::ReadDataPage(_) => MAX_PAGE_SIZE,
            _ => 0,
        }
    }

    /// Little-endian request: magic, sequence, max response, command,
    /// reserved, then the optional parameter word.
    pub fn encode(self, sequence: u32) -> Vec<u8> {
        let mut words = vec![
            REQUEST_MAGIC,
            sequence,
            self.max_response() as u32,
            self.code(),
            0,
        ];
        words.extend(self.param());
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }
}

/// Sequenced command exchange over a [`ControlChannel`].
pub struct CommandChannel<C> {
    control: C,
    sequence: u32,
    timeout: Duration,
}

impl<C: ControlChannel> CommandChannel<C> {
    pub fn new(control: C, timeout: Duration) -> Self {
        Self {
            control,
            sequence: 0,
            timeout,
        }
    }

    /// Send `command`; returns the response payload, empty for commands
    /// without one.
    #[instrument(skip(self))]
    pub fn send(&mut self, command: Command) -> Result<Vec<u8>> {
        self.sequence = self.sequence.wrapping_add(1);
        let sequence = self.sequence;
        let request = command.encode(sequence);

        let sent = self
            .control
            .bulk_out(OUTBOUND_ENDPOINT, &request, self.timeout)?;
        if sent != request.len() {
            return Err(TransportError::Short {
                expected: request.len(),
                actual: sent,
            }
            .into());
        }

        let mut response = vec![0u8; command.max_response()];
        if !response.is_empty() {
            let received = self
                .control
                .bulk_in(INBOUND_ENDPOINT, &mut response, self.timeout)?;
            response.truncate(received);
        }

        let mut completion = [0u8; COMPLETION_WORDS * 4];
        let received = self
            .control
            .bulk_in(INBOUND_ENDPOINT, &mut completion, self.timeout)?;
        let word = |i: usize| {
            completion
                .get(i * 4..i * 4 + 4)
                .filter(|_| received >= i * 4 + 4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .unwrap_or(0)
        };
        if word(0) != RESPONSE_MAGIC {
            warn!(
                "unexpected magic in completion: {:08x} != {:08x}",
                word(0),
                RESPONSE_MAGIC
            );
        } else if word(1) != sequence {
            warn!(
                "unexpected sequence in completion: {:08x} != {:08x}",
                word(1),
                sequence
            );
        }

        debug!(code = command.code(), bytes = response.len(), "command done");
        Ok(response)
    }

    pub fn read_data_page(&mut self, page: DataPage) -> Result<Vec<u8>> {
        self.send(Command::ReadDataPage(page))
    }

    pub fn into_inner(self) -> C {
        self.control
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::transport::TransportResult;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct Scripted {
        sent: Vec<Vec<u8>>,
        replies: VecDeque<Vec<u8>>,
    }

    impl ControlChannel for Scripted {
        fn bulk_out(&mut self, endpoint: u8, data: &[u8], _: Duration) -> TransportResult<usize> {
            assert_eq!(endpoint, OUTBOUND_ENDPOINT);
            self.sent.push(data.to_vec());
            Ok(data.len())
        }

        fn bulk_in(&mut self, endpoint: u8, buf: &mut [u8], _: Duration) -> TransportResult<usize> {
            assert_eq!(endpoint, INBOUND_ENDPOINT);
            let reply = self.replies.pop_front().ok_or(TransportError::Timeout)?;
            buf[..reply.len()].copy_from_slice(&reply);
            Ok(reply.len())
        }
    }

    fn completion(sequence: u32) -> Vec<u8> {
        let mut words = [0u32; COMPLETION_WORDS];
        words[0] = RESPONSE_MAGIC;
        words[1] = sequence;
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn encodes_request_layout() {
        let bytes = Command::SetStreaming(true).encode(3);
        assert_eq!(bytes.len(), REQUEST_HEADER_SIZE + 4);
        let words: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(words, vec![REQUEST_MAGIC, 3, 0, 0x2B, 0, 1]);

        assert_eq!(Command::StopDepth.encode(1).len(), REQUEST_HEADER_SIZE);
    }

    #[test]
    fn read_page_returns_response_payload() {
        let mut scripted = Scripted::default();
        scripted.replies.push_back(vec![1, 2, 3, 4]);
        scripted.replies.push_back(completion(1));

        let mut channel = CommandChannel::new(scripted, Duration::from_millis(10));
        let page = channel.read_data_page(DataPage::DepthParams).unwrap();
        assert_eq!(page, vec![1, 2, 3, 4]);

        let scripted = channel.into_inner();
        let request = &scripted.sent[0];
        assert_eq!(&request[12..16], &0x22u32.to_le_bytes());
        assert_eq!(&request[20..24], &0x03u32.to_le_bytes());
        assert_eq!(&request[8..12], &(MAX_PAGE_SIZE as u32).to_le_bytes());
    }

    #[test]
    fn sequence_advances_and_mismatch_is_tolerated() {
        let mut scripted = Scripted::default();
        scripted.replies.push_back(completion(1));
        scripted.replies.push_back(completion(99));

        let mut channel = CommandChannel::new(scripted, Duration::from_millis(10));
        assert!(channel.send(Command::StartDepth).unwrap().is_empty());
        assert!(channel.send(Command::StopDepth).unwrap().is_empty());

        let scripted = channel.into_inner();
        assert_eq!(&scripted.sent[1][4..8], &2u32.to_le_bytes());
    }

    #[test]
    fn missing_completion_is_an_error() {
        let mut channel = CommandChannel::new(Scripted::default(), Duration::from_millis(10));
        let err = channel.send(Command::StartDepth).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Transport(TransportError::Timeout)
        ));
    }
}
