//! Streaming parser for the ustar archives inside a base backup
//!
//! The server frames each tablespace as one POSIX ustar archive embedded in
//! a COPY stream. Chunk boundaries land anywhere, so the parser buffers at
//! most one 512-byte header block and otherwise passes body bytes straight
//! through to a sink.
//!
//! Only the subset the server emits is understood: regular files,
//! directories, and symbolic links to directories. Header checksums are not
//! verified; the archive arrives over an already-checked connection from a
//! trusted sender.

use crate::error::{Result, StreamError};

/// Size of one tar block; headers occupy exactly one block and bodies are
/// padded with NUL to the next block boundary.
pub const TAR_BLOCK_SIZE: usize = 512;

// ustar header field offsets
const NAME_RANGE: std::ops::Range<usize> = 0..100;
const MODE_RANGE: std::ops::Range<usize> = 100..108;
const SIZE_RANGE: std::ops::Range<usize> = 124..136;
const MTIME_RANGE: std::ops::Range<usize> = 136..148;
const TYPEFLAG_OFFSET: usize = 156;
const LINKNAME_RANGE: std::ops::Range<usize> = 157..257;

/// What kind of filesystem object a tar entry describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    Directory,
    /// Symbolic link whose target is a directory (the only link kind the
    /// server produces, for tablespaces under pg_tblspc)
    DirectorySymlink,
}

/// One parsed tar entry header
#[derive(Debug, Clone)]
pub struct TarEntry {
    /// Entry path, relative to the archive root. Directories and directory
    /// symlinks keep their trailing slash as sent.
    pub name: String,
    /// Permission bits from the octal mode field
    pub mode: u32,
    /// Body size in bytes (always 0 for directories and symlinks)
    pub size: u64,
    /// Modification time, seconds since the Unix epoch
    pub mtime: u64,
    pub kind: EntryKind,
    /// Link target, present exactly when `kind` is `DirectorySymlink`
    pub link_target: Option<String>,
}

/// Receiver of parse events, in order: `entry_start`, zero or more
/// `entry_data` calls totalling `entry.size` bytes, then `entry_end`.
pub trait TarSink {
    fn entry_start(&mut self, entry: &TarEntry) -> Result<()>;
    fn entry_data(&mut self, data: &[u8]) -> Result<()>;
    fn entry_end(&mut self) -> Result<()>;
}

#[derive(Debug)]
enum ParserState {
    /// Waiting for the next 512-byte header block
    AwaitHeader,
    /// Inside an entry body
    InBody { remaining: u64, padding: usize },
    /// Body complete, discarding NUL padding up to the block boundary
    InPadding { padding: usize },
    /// Saw an all-zero block: end of archive
    Done,
}

/// Restartable streaming tar parser
///
/// Feed arbitrary-sized chunks with [`TarParser::feed`]; call
/// [`TarParser::finish`] when the enclosing COPY stream ends to verify the
/// archive did not stop mid-entry.
#[derive(Debug)]
pub struct TarParser {
    state: ParserState,
    /// Holds a partial header block when one spans chunk boundaries
    header_buf: Vec<u8>,
}

impl TarParser {
    pub fn new() -> Self {
        Self {
            state: ParserState::AwaitHeader,
            header_buf: Vec::with_capacity(TAR_BLOCK_SIZE),
        }
    }

    /// Consume one chunk of archive bytes, emitting events into `sink`.
    ///
    /// # Errors
    ///
    /// Unknown typeflags, malformed header fields, and bytes after the
    /// end-of-archive marker are protocol errors. Sink errors propagate
    /// unchanged.
    pub fn feed<S: TarSink>(&mut self, mut chunk: &[u8], sink: &mut S) -> Result<()> {
        while !chunk.is_empty() {
            match self.state {
                ParserState::AwaitHeader => {
                    let block = if self.header_buf.is_empty() && chunk.len() >= TAR_BLOCK_SIZE {
                        let (block, rest) = chunk.split_at(TAR_BLOCK_SIZE);
                        chunk = rest;
                        block
                    } else {
                        let need = TAR_BLOCK_SIZE - self.header_buf.len();
                        let take = need.min(chunk.len());
                        self.header_buf.extend_from_slice(&chunk[..take]);
                        chunk = &chunk[take..];
                        if self.header_buf.len() < TAR_BLOCK_SIZE {
                            break;
                        }
                        &self.header_buf[..]
                    };

                    if block.iter().all(|&b| b == 0) {
                        self.state = ParserState::Done;
                        self.header_buf.clear();
                        continue;
                    }

                    let entry = parse_header(block)?;
                    self.header_buf.clear();

                    sink.entry_start(&entry)?;
                    if entry.kind == EntryKind::Regular && entry.size > 0 {
                        self.state = ParserState::InBody {
                            remaining: entry.size,
                            padding: block_padding(entry.size),
                        };
                    } else {
                        sink.entry_end()?;
                    }
                }

                ParserState::InBody { remaining, padding } => {
                    let take = (remaining.min(chunk.len() as u64)) as usize;
                    sink.entry_data(&chunk[..take])?;
                    chunk = &chunk[take..];

                    let remaining = remaining - take as u64;
                    if remaining == 0 {
                        if padding == 0 {
                            sink.entry_end()?;
                            self.state = ParserState::AwaitHeader;
                        } else {
                            self.state = ParserState::InPadding { padding };
                        }
                    } else {
                        self.state = ParserState::InBody { remaining, padding };
                    }
                }

                ParserState::InPadding { padding } => {
                    let take = padding.min(chunk.len());
                    chunk = &chunk[take..];

                    let padding = padding - take;
                    if padding == 0 {
                        sink.entry_end()?;
                        self.state = ParserState::AwaitHeader;
                    } else {
                        self.state = ParserState::InPadding { padding };
                    }
                }

                ParserState::Done => {
                    // The terminator may be followed by more NUL blocks from
                    // senders that round the archive up to a blocking factor
                    if chunk.iter().any(|&b| b != 0) {
                        return Err(StreamError::protocol(
                            "data after tar end-of-archive marker",
                        ));
                    }
                    chunk = &[];
                }
            }
        }

        Ok(())
    }

    /// Check that the stream did not end inside an entry.
    ///
    /// The server closes the COPY stream at the archive boundary without
    /// necessarily sending the two-zero-block terminator, so ending in
    /// `AwaitHeader` with no buffered header bytes is as valid as an
    /// explicit terminator.
    pub fn finish(&self) -> Result<()> {
        match self.state {
            ParserState::Done => Ok(()),
            ParserState::AwaitHeader if self.header_buf.is_empty() => Ok(()),
            ParserState::AwaitHeader => Err(StreamError::protocol(
                "archive ended inside a tar header block",
            )),
            ParserState::InBody { remaining, .. } => Err(StreamError::protocol(format!(
                "archive ended mid-entry: {remaining} bytes of body missing"
            ))),
            ParserState::InPadding { .. } => Err(StreamError::protocol(
                "archive ended inside entry padding",
            )),
        }
    }

    /// True once the end-of-archive marker has been consumed
    pub fn saw_terminator(&self) -> bool {
        matches!(self.state, ParserState::Done)
    }
}

impl Default for TarParser {
    fn default() -> Self {
        Self::new()
    }
}

/// NUL padding after a body of the given size, up to the block boundary
fn block_padding(size: u64) -> usize {
    (size.wrapping_neg() & (TAR_BLOCK_SIZE as u64 - 1)) as usize
}

/// NUL-terminated string field
fn parse_string_field(field: &[u8], what: &str) -> Result<String> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8(field[..end].to_vec())
        .map_err(|e| StreamError::protocol(format!("invalid {what} in tar header: {e}")))
}

/// Octal number field, digits terminated by NUL or space
fn parse_octal_field(field: &[u8], what: &str) -> Result<u64> {
    let digits: &[u8] = {
        let end = field
            .iter()
            .position(|&b| b == 0 || b == b' ')
            .unwrap_or(field.len());
        &field[..end]
    };
    let text = std::str::from_utf8(digits)
        .map_err(|_| StreamError::protocol(format!("non-ascii {what} in tar header")))?;
    u64::from_str_radix(text.trim_start(), 8)
        .map_err(|e| StreamError::protocol(format!("could not parse {what} in tar header: {e}")))
}

fn parse_header(block: &[u8]) -> Result<TarEntry> {
    debug_assert_eq!(block.len(), TAR_BLOCK_SIZE);

    let name = parse_string_field(&block[NAME_RANGE], "file name")?;
    if name.is_empty() {
        return Err(StreamError::protocol("tar header with empty file name"));
    }
    let mode = parse_octal_field(&block[MODE_RANGE], "file mode")? as u32;
    let size = parse_octal_field(&block[SIZE_RANGE], "file size")?;
    let mtime = parse_octal_field(&block[MTIME_RANGE], "mtime")?;
    let typeflag = block[TYPEFLAG_OFFSET];

    let (kind, size, link_target) = match typeflag {
        b'0' | 0 => (EntryKind::Regular, size, None),
        b'5' => (EntryKind::Directory, 0, None),
        b'2' => {
            if !name.ends_with('/') {
                return Err(StreamError::protocol(format!(
                    "symbolic link \"{name}\" does not point to a directory"
                )));
            }
            let target = parse_string_field(&block[LINKNAME_RANGE], "link target")?;
            if target.is_empty() {
                return Err(StreamError::protocol(format!(
                    "symbolic link \"{name}\" has no target"
                )));
            }
            (EntryKind::DirectorySymlink, 0, Some(target))
        }
        other => {
            return Err(StreamError::protocol(format!(
                "unknown tar entry type '{}' for \"{}\"",
                other as char, name
            )))
        }
    };

    Ok(TarEntry {
        name,
        mode,
        size,
        mtime,
        kind,
        link_target,
    })
}
