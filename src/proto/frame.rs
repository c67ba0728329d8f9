//! Length-prefixed framing.
//!
//! Wire frames are `<len:i32><payload:len bytes>` with `len` big-endian and
//! bounded by the configured maximum. Before the handshake completes the
//! length word doubles as a command channel: if it matches one of the
//! four-letter diagnostic tokens the connection is diverted instead of
//! reading a payload.

use bytes::{BufMut, Bytes, BytesMut};
use std::io::{self, Read};

/// A diagnostic probe encoded as the big-endian packing of four ASCII bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Conf,
    Cons,
    Crst,
    Dump,
    Envi,
    Gtmk,
    Ruok,
    Stmk,
    Srst,
    Srvr,
    Stat,
    Wchc,
    Wchp,
    Wchs,
}

const fn token(b: &[u8; 4]) -> i32 {
    i32::from_be_bytes(*b)
}

const CONF: i32 = token(b"conf");
const CONS: i32 = token(b"cons");
const CRST: i32 = token(b"crst");
const DUMP: i32 = token(b"dump");
const ENVI: i32 = token(b"envi");
const GTMK: i32 = token(b"gtmk");
const RUOK: i32 = token(b"ruok");
const STMK: i32 = token(b"stmk");
const SRST: i32 = token(b"srst");
const SRVR: i32 = token(b"srvr");
const STAT: i32 = token(b"stat");
const WCHC: i32 = token(b"wchc");
const WCHP: i32 = token(b"wchp");
const WCHS: i32 = token(b"wchs");

impl Probe {
    /// Look a length word up in the closed token set.
    pub fn lookup(len: i32) -> Option<Probe> {
        match len {
            CONF => Some(Probe::Conf),
            CONS => Some(Probe::Cons),
            CRST => Some(Probe::Crst),
            DUMP => Some(Probe::Dump),
            ENVI => Some(Probe::Envi),
            GTMK => Some(Probe::Gtmk),
            RUOK => Some(Probe::Ruok),
            STMK => Some(Probe::Stmk),
            SRST => Some(Probe::Srst),
            SRVR => Some(Probe::Srvr),
            STAT => Some(Probe::Stat),
            WCHC => Some(Probe::Wchc),
            WCHP => Some(Probe::Wchp),
            WCHS => Some(Probe::Wchs),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Probe::Conf => "conf",
            Probe::Cons => "cons",
            Probe::Crst => "crst",
            Probe::Dump => "dump",
            Probe::Envi => "envi",
            Probe::Gtmk => "gtmk",
            Probe::Ruok => "ruok",
            Probe::Stmk => "stmk",
            Probe::Srst => "srst",
            Probe::Srvr => "srvr",
            Probe::Stat => "stat",
            Probe::Wchc => "wchc",
            Probe::Wchp => "wchp",
            Probe::Wchs => "wchs",
        }
    }
}

/// Outcome of driving the reader against a readable socket.
#[derive(Debug)]
pub enum ReadEvent {
    /// The socket would block; partial state is retained.
    NeedMore,
    /// A complete payload.
    Frame(Bytes),
    /// A pre-handshake length word matched the probe table.
    Probe(Probe),
}

/// Framing failure. Any of these closes the connection.
#[derive(Debug)]
pub enum FrameError {
    /// Peer closed its sending side.
    EndOfStream,
    /// Length word negative or above the configured maximum.
    BadLength(i32),
    Io(io::Error),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::EndOfStream => write!(f, "end of stream"),
            FrameError::BadLength(len) => write!(f, "len error {len}"),
            FrameError::Io(e) => write!(f, "read failed: {e}"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        FrameError::Io(e)
    }
}

struct Payload {
    buf: Vec<u8>,
    filled: usize,
}

/// Two-phase frame reader: fill the 4-byte length word, then fill a payload
/// buffer of exactly that size. Partial fills survive across calls.
pub struct FrameReader {
    max_frame: usize,
    len_buf: [u8; 4],
    len_filled: usize,
    payload: Option<Payload>,
}

impl FrameReader {
    pub fn new(max_frame: usize) -> Self {
        Self {
            max_frame,
            len_buf: [0; 4],
            len_filled: 0,
            payload: None,
        }
    }

    /// Drive the reader until it produces an event. At most one frame is
    /// returned per call; the caller loops while data and read interest
    /// remain.
    pub fn read_from<R: Read>(
        &mut self,
        sock: &mut R,
        recognize_probes: bool,
    ) -> Result<ReadEvent, FrameError> {
        loop {
            if self.payload.is_none() {
                match self.fill_length(sock)? {
                    None => return Ok(ReadEvent::NeedMore),
                    Some(len) => {
                        if recognize_probes {
                            if let Some(probe) = Probe::lookup(len) {
                                return Ok(ReadEvent::Probe(probe));
                            }
                        }
                        if len < 0 || len as usize > self.max_frame {
                            return Err(FrameError::BadLength(len));
                        }
                        if len == 0 {
                            return Ok(ReadEvent::Frame(Bytes::new()));
                        }
                        self.payload = Some(Payload {
                            buf: vec![0u8; len as usize],
                            filled: 0,
                        });
                    }
                }
            }

            let payload = self.payload.as_mut().unwrap();
            match read_some(sock, &mut payload.buf[payload.filled..])? {
                None => return Ok(ReadEvent::NeedMore),
                Some(n) => {
                    payload.filled += n;
                    if payload.filled == payload.buf.len() {
                        let done = self.payload.take().unwrap();
                        return Ok(ReadEvent::Frame(Bytes::from(done.buf)));
                    }
                }
            }
        }
    }

    /// Fill the length word, returning the decoded value once complete.
    fn fill_length<R: Read>(&mut self, sock: &mut R) -> Result<Option<i32>, FrameError> {
        while self.len_filled < 4 {
            match read_some(sock, &mut self.len_buf[self.len_filled..])? {
                None => return Ok(None),
                Some(n) => self.len_filled += n,
            }
        }
        self.len_filled = 0;
        Ok(Some(i32::from_be_bytes(self.len_buf)))
    }
}

/// One non-blocking read. `Ok(None)` means the socket would block.
fn read_some<R: Read>(sock: &mut R, buf: &mut [u8]) -> Result<Option<usize>, FrameError> {
    loop {
        match sock.read(buf) {
            Ok(0) => return Err(FrameError::EndOfStream),
            Ok(n) => return Ok(Some(n)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(FrameError::Io(e)),
        }
    }
}

/// Build a length-prefixed frame: a 4-byte placeholder is written first, the
/// body serialised, and the placeholder patched with the measured length.
pub fn encode_frame<F: FnOnce(&mut BytesMut)>(write_body: F) -> Bytes {
    let mut buf = BytesMut::with_capacity(128);
    buf.put_i32(0);
    write_body(&mut buf);
    let body_len = (buf.len() - 4) as i32;
    buf[..4].copy_from_slice(&body_len.to_be_bytes());
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Yields one byte per read, interleaved with `WouldBlock`, so every
    /// reader state is exercised across calls.
    struct ByteAtATime {
        data: Vec<u8>,
        pos: usize,
        armed: bool,
    }

    impl ByteAtATime {
        fn new(data: Vec<u8>) -> Self {
            Self {
                data,
                pos: 0,
                armed: false,
            }
        }

        fn exhausted(&self) -> bool {
            self.pos == self.data.len()
        }
    }

    impl Read for ByteAtATime {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if !self.armed || self.exhausted() {
                self.armed = true;
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "not yet"));
            }
            self.armed = false;
            buf[0] = self.data[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    fn encode_payload(p: &[u8]) -> Bytes {
        encode_frame(|buf| buf.extend_from_slice(p))
    }

    #[test]
    fn test_encode_patches_length() {
        let frame = encode_payload(b"abc");
        assert_eq!(&frame[..], &[0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn test_round_trip_single_frame() {
        let frame = encode_payload(b"hello");
        let mut reader = FrameReader::new(1024);
        let mut sock = Cursor::new(frame.to_vec());
        match reader.read_from(&mut sock, false).unwrap() {
            ReadEvent::Frame(p) => assert_eq!(&p[..], b"hello"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_streamed_one_byte_at_a_time() {
        let payloads: [&[u8]; 3] = [b"first", b"", b"third payload"];
        let mut stream = Vec::new();
        for p in payloads {
            stream.extend_from_slice(&encode_payload(p));
        }

        let mut sock = ByteAtATime::new(stream);
        let mut reader = FrameReader::new(1024);
        let mut frames: Vec<Bytes> = Vec::new();
        while !(sock.exhausted() && frames.len() == payloads.len()) {
            match reader.read_from(&mut sock, false).unwrap() {
                ReadEvent::NeedMore => {}
                ReadEvent::Frame(p) => frames.push(p),
                other => panic!("unexpected: {:?}", other),
            }
        }
        assert_eq!(frames.len(), 3);
        for (frame, payload) in frames.iter().zip(payloads) {
            assert_eq!(&frame[..], payload);
        }
    }

    #[test]
    fn test_at_most_one_parse_per_frame() {
        let mut sock = ByteAtATime::new(encode_payload(b"once").to_vec());
        let mut reader = FrameReader::new(1024);
        let mut seen = 0;
        for _ in 0..64 {
            match reader.read_from(&mut sock, false).unwrap() {
                ReadEvent::Frame(_) => seen += 1,
                ReadEvent::NeedMore => {}
                other => panic!("unexpected: {:?}", other),
            }
        }
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_negative_length_rejected() {
        let mut sock = Cursor::new((-5i32).to_be_bytes().to_vec());
        let mut reader = FrameReader::new(1024);
        match reader.read_from(&mut sock, false) {
            Err(FrameError::BadLength(-5)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut sock = Cursor::new(2048i32.to_be_bytes().to_vec());
        let mut reader = FrameReader::new(1024);
        match reader.read_from(&mut sock, false) {
            Err(FrameError::BadLength(2048)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_eof_reported() {
        let mut sock = Cursor::new(Vec::new());
        let mut reader = FrameReader::new(1024);
        match reader.read_from(&mut sock, false) {
            Err(FrameError::EndOfStream) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_probe_recognised_before_handshake() {
        let mut sock = Cursor::new(b"ruok".to_vec());
        let mut reader = FrameReader::new(1024);
        match reader.read_from(&mut sock, true).unwrap() {
            ReadEvent::Probe(Probe::Ruok) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_probe_not_recognised_after_handshake() {
        // Post-handshake the same four bytes are just an oversized length.
        let mut sock = Cursor::new(b"ruok".to_vec());
        let mut reader = FrameReader::new(1024 * 1024);
        match reader.read_from(&mut sock, false) {
            Err(FrameError::BadLength(len)) => {
                assert_eq!(len, i32::from_be_bytes(*b"ruok"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_all_fourteen_tokens() {
        let names = [
            "conf", "cons", "crst", "dump", "envi", "gtmk", "ruok", "stmk", "srst", "srvr",
            "stat", "wchc", "wchp", "wchs",
        ];
        for name in names {
            let word = i32::from_be_bytes(name.as_bytes().try_into().unwrap());
            let probe = Probe::lookup(word).unwrap();
            assert_eq!(probe.name(), name);
        }
        assert_eq!(Probe::lookup(44), None);
        assert_eq!(Probe::lookup(token(b"wxyz")), None);
    }
}
