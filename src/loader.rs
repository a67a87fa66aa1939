//! Streaming loader for the heap snapshot wire format.
//!
//! Snapshots routinely run to gigabytes, so the loader never builds a generic
//! JSON value for the big arrays. It is a state machine fed with chunks of
//! arbitrary size: the metadata object is cut out by bracket matching and
//! handed to `serde_json`, while `nodes`, `edges` and the other flat arrays are
//! scanned digit by digit straight into `u32` buffers.
//!
//! # Example
//!
//! ```no_run
//! use heapsnap::loader::Loader;
//! use std::fs::File;
//!
//! let raw = Loader::load(File::open("Heap.heapsnapshot").unwrap()).unwrap();
//! println!("{} node fields", raw.nodes.len());
//! ```

use std::io::Read;
use thiserror::Error;
use tracing::{debug, warn};

use crate::meta::SnapshotHeader;

/// Errors that can occur while loading a snapshot.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no \"{0}\" section found in snapshot")]
    MissingSection(&'static str),

    #[error("input ended inside \"{0}\"")]
    UnexpectedEnd(&'static str),

    #[error("value in \"{0}\" does not fit in 32 bits")]
    NumberOutOfRange(&'static str),

    #[error("malformed \"{section}\" at byte {offset}")]
    Malformed { section: &'static str, offset: usize },

    #[error("loader is already closed")]
    AlreadyClosed,

    #[error("loader aborted after an earlier error")]
    Aborted,
}

pub type Result<T> = std::result::Result<T, LoadError>;

const SNAPSHOT_TOKEN: &[u8] = b"\"snapshot\"";
const TRACE_TREE_TOKEN: &[u8] = b"\"trace_tree\"";
const STRINGS_TOKEN: &[u8] = b"\"strings\"";

/// Size of the chunks [`Loader::load`] feeds from a reader.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Receives loader status updates.
pub trait Progress {
    fn update_status(&self, status: &str);
    fn update_progress(&self, title: &str, value: usize, total: usize);
    fn report_problem(&self, message: &str);
}

/// Progress sink that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl Progress for LogProgress {
    fn update_status(&self, status: &str) {
        debug!("{}", status);
    }

    fn update_progress(&self, title: &str, value: usize, total: usize) {
        debug!("{} {}%", title, percent(value, total));
    }

    fn report_problem(&self, message: &str) {
        warn!("broken snapshot: {}", message);
    }
}

/// Integer percentage, clamped to 100.
pub fn percent(value: usize, total: usize) -> u32 {
    if total == 0 {
        return 100;
    }
    ((value.min(total) as u64 * 100) / total as u64) as u32
}

/// A flat numeric section of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Nodes,
    Edges,
    TraceFunctionInfos,
    Samples,
    Locations,
}

impl Section {
    fn token(self) -> &'static [u8] {
        match self {
            Section::Nodes => b"\"nodes\"",
            Section::Edges => b"\"edges\"",
            Section::TraceFunctionInfos => b"\"trace_function_infos\"",
            Section::Samples => b"\"samples\"",
            Section::Locations => b"\"locations\"",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Section::Nodes => "nodes",
            Section::Edges => "edges",
            Section::TraceFunctionInfos => "trace_function_infos",
            Section::Samples => "samples",
            Section::Locations => "locations",
        }
    }

    fn title(self) -> &'static str {
        match self {
            Section::Nodes => "Loading nodes…",
            Section::Edges => "Loading edges…",
            Section::TraceFunctionInfos => "Loading allocation traces…",
            Section::Samples => "Loading samples…",
            Section::Locations => "Loading locations…",
        }
    }

    fn required(self) -> bool {
        matches!(self, Section::Nodes | Section::Edges)
    }
}

/// Where the loader currently is in the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderState {
    AwaitMetadata,
    ParseMetadata,
    AwaitArray(Section),
    ParseArray(Section),
    AwaitTraceTree,
    ParseTraceTree,
    AwaitStrings,
    AccumulateStrings,
    Done,
    Failed,
}

impl LoaderState {
    fn end_of_input_error(self) -> LoadError {
        match self {
            LoaderState::AwaitMetadata => LoadError::MissingSection("snapshot"),
            LoaderState::ParseMetadata => LoadError::UnexpectedEnd("snapshot"),
            LoaderState::AwaitArray(section) if section.required() => {
                LoadError::MissingSection(section.name())
            }
            LoaderState::ParseArray(section) => LoadError::UnexpectedEnd(section.name()),
            LoaderState::ParseTraceTree => LoadError::UnexpectedEnd("trace_tree"),
            LoaderState::Done => LoadError::AlreadyClosed,
            LoaderState::Failed => LoadError::Aborted,
            _ => LoadError::MissingSection("strings"),
        }
    }
}

/// One element of a nested `trace_tree` array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceItem {
    Number(u32),
    /// Index of a nested array in [`TraceTree`].
    Array(usize),
}

/// The nested `trace_tree` array, flattened into an arena of arrays.
///
/// Array 0 is the outermost one. Allocation stacks can nest far deeper than
/// `serde_json`'s recursion limit, so this is parsed iteratively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceTree {
    arrays: Vec<Vec<TraceItem>>,
}

impl TraceTree {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut arrays: Vec<Vec<TraceItem>> = Vec::new();
        let mut open: Vec<usize> = Vec::new();
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                b'[' => {
                    let id = arrays.len();
                    arrays.push(Vec::new());
                    if let Some(&parent) = open.last() {
                        arrays[parent].push(TraceItem::Array(id));
                    }
                    open.push(id);
                    i += 1;
                }
                b']' => {
                    if open.pop().is_none() {
                        return Err(LoadError::Malformed {
                            section: "trace_tree",
                            offset: i,
                        });
                    }
                    i += 1;
                    if open.is_empty() {
                        break;
                    }
                }
                b'0'..=b'9' => {
                    let Some(&current) = open.last() else {
                        return Err(LoadError::Malformed {
                            section: "trace_tree",
                            offset: i,
                        });
                    };
                    let mut value: u64 = 0;
                    while i < bytes.len() && bytes[i].is_ascii_digit() {
                        value = value * 10 + u64::from(bytes[i] - b'0');
                        if value > u64::from(u32::MAX) {
                            return Err(LoadError::NumberOutOfRange("trace_tree"));
                        }
                        i += 1;
                    }
                    arrays[current].push(TraceItem::Number(value as u32));
                }
                _ => i += 1,
            }
        }
        if !open.is_empty() {
            return Err(LoadError::UnexpectedEnd("trace_tree"));
        }
        Ok(TraceTree { arrays })
    }

    /// Items of the outermost array, if there is one.
    pub fn root(&self) -> Option<&[TraceItem]> {
        self.arrays.first().map(Vec::as_slice)
    }

    pub fn array(&self, id: usize) -> &[TraceItem] {
        self.arrays.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.root().is_none_or(|root| root.is_empty())
    }
}

/// Everything the loader extracts from a complete payload.
#[derive(Debug, Clone)]
pub struct RawSnapshot {
    pub header: SnapshotHeader,
    pub nodes: Vec<u32>,
    pub edges: Vec<u32>,
    pub trace_function_infos: Vec<u32>,
    pub trace_tree: TraceTree,
    pub samples: Vec<u32>,
    pub locations: Vec<u32>,
    pub strings: Vec<String>,
}

/// Tracks bracket depth across chunks while cutting out one JSON value.
#[derive(Debug, Clone, Copy, Default)]
struct BalancedScan {
    depth: usize,
    in_string: bool,
    escaped: bool,
    offset: usize,
}

impl BalancedScan {
    /// Continues scanning `buf` (which starts at the opening bracket) and
    /// returns the index of the matching closing bracket once it arrived.
    fn advance(&mut self, buf: &[u8], open: u8, close: u8) -> Option<usize> {
        while self.offset < buf.len() {
            let b = buf[self.offset];
            self.offset += 1;
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
                continue;
            }
            if b == b'"' {
                self.in_string = true;
            } else if b == open {
                self.depth += 1;
            } else if b == close {
                self.depth = self.depth.saturating_sub(1);
                if self.depth == 0 {
                    return Some(self.offset - 1);
                }
            }
        }
        None
    }
}

/// Incremental heap snapshot parser.
pub struct Loader {
    state: LoaderState,
    buffer: Vec<u8>,
    scan: BalancedScan,
    array: Vec<u32>,
    header: Option<SnapshotHeader>,
    nodes: Vec<u32>,
    edges: Vec<u32>,
    trace_function_infos: Vec<u32>,
    trace_tree: TraceTree,
    samples: Vec<u32>,
    locations: Vec<u32>,
    progress: Box<dyn Progress>,
}

impl Loader {
    /// Create a loader that reports progress through the log.
    pub fn new() -> Self {
        Self::with_progress(Box::new(LogProgress))
    }

    pub fn with_progress(progress: Box<dyn Progress>) -> Self {
        Self {
            state: LoaderState::AwaitMetadata,
            buffer: Vec::new(),
            scan: BalancedScan::default(),
            array: Vec::new(),
            header: None,
            nodes: Vec::new(),
            edges: Vec::new(),
            trace_function_infos: Vec::new(),
            trace_tree: TraceTree::default(),
            samples: Vec::new(),
            locations: Vec::new(),
            progress,
        }
    }

    /// Read a whole snapshot from `reader` in [`CHUNK_SIZE`] pieces.
    pub fn load<R: Read>(reader: R) -> Result<RawSnapshot> {
        let mut loader = Loader::new();
        loader.read_from(reader)?;
        loader.close()
    }

    /// Feed everything `reader` yields without closing the loader.
    pub fn read_from<R: Read>(&mut self, mut reader: R) -> Result<()> {
        let mut chunk = vec![0u8; CHUNK_SIZE];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => return Ok(()),
                Ok(n) => self.write(&chunk[..n])?,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn state(&self) -> LoaderState {
        self.state
    }

    /// Append the next chunk of the payload.
    pub fn write(&mut self, chunk: &[u8]) -> Result<()> {
        match self.state {
            LoaderState::Done => return Err(LoadError::AlreadyClosed),
            LoaderState::Failed => return Err(LoadError::Aborted),
            _ => {}
        }
        self.buffer.extend_from_slice(chunk);
        if let Err(err) = self.advance() {
            self.fail(&err);
            return Err(err);
        }
        if let LoaderState::ParseArray(section) = self.state {
            let total = self.expected_len(section);
            self.progress
                .update_progress(section.title(), self.array.len(), total);
        }
        Ok(())
    }

    /// Signal end of input and hand out the parsed snapshot.
    pub fn close(&mut self) -> Result<RawSnapshot> {
        if self.state != LoaderState::AccumulateStrings {
            let err = self.state.end_of_input_error();
            if !matches!(err, LoadError::AlreadyClosed | LoadError::Aborted) {
                self.fail(&err);
            }
            return Err(err);
        }
        self.progress.update_status("Parsing strings…");
        let strings = match self.buffer.iter().rposition(|&b| b == b']') {
            Some(end) => parse_string_array(&self.buffer[..=end]),
            None => Err(LoadError::UnexpectedEnd("strings")),
        };
        let strings = match strings {
            Ok(strings) => strings,
            Err(err) => {
                self.fail(&err);
                return Err(err);
            }
        };
        let header = self.header.take().ok_or(LoadError::MissingSection("snapshot"))?;
        self.state = LoaderState::Done;
        self.buffer = Vec::new();
        self.progress.update_status("Snapshot loaded");
        Ok(RawSnapshot {
            header,
            nodes: std::mem::take(&mut self.nodes),
            edges: std::mem::take(&mut self.edges),
            trace_function_infos: std::mem::take(&mut self.trace_function_infos),
            trace_tree: std::mem::take(&mut self.trace_tree),
            samples: std::mem::take(&mut self.samples),
            locations: std::mem::take(&mut self.locations),
            strings,
        })
    }

    fn fail(&mut self, err: &LoadError) {
        self.state = LoaderState::Failed;
        self.buffer = Vec::new();
        self.progress.report_problem(&err.to_string());
    }

    fn advance(&mut self) -> Result<()> {
        loop {
            let progressed = match self.state {
                LoaderState::AwaitMetadata => {
                    if self.seek(&[SNAPSHOT_TOKEN], b'{').is_some() {
                        self.progress.update_status("Loading snapshot info…");
                        self.scan = BalancedScan::default();
                        self.state = LoaderState::ParseMetadata;
                        true
                    } else {
                        false
                    }
                }
                LoaderState::ParseMetadata => {
                    match self.scan.advance(&self.buffer, b'{', b'}') {
                        Some(end) => {
                            let header: SnapshotHeader =
                                serde_json::from_slice(&self.buffer[..=end])?;
                            self.buffer.drain(..=end);
                            self.header = Some(header);
                            self.state = LoaderState::AwaitArray(Section::Nodes);
                            true
                        }
                        None => false,
                    }
                }
                LoaderState::AwaitArray(section) => {
                    let found = if section.required() {
                        self.seek(&[section.token()], b'[')
                    } else {
                        self.seek(&[section.token(), STRINGS_TOKEN], b'[')
                    };
                    match found {
                        Some(0) => {
                            self.buffer.drain(..1);
                            self.array = Vec::with_capacity(self.expected_len(section));
                            self.state = LoaderState::ParseArray(section);
                            true
                        }
                        Some(_) => self.enter_strings(),
                        None => false,
                    }
                }
                LoaderState::ParseArray(section) => {
                    if self.parse_uint_array(section)? {
                        let values = std::mem::take(&mut self.array);
                        self.state = self.store(section, values);
                        true
                    } else {
                        false
                    }
                }
                LoaderState::AwaitTraceTree => {
                    match self.seek(&[TRACE_TREE_TOKEN, STRINGS_TOKEN], b'[') {
                        Some(0) => {
                            self.scan = BalancedScan::default();
                            self.state = LoaderState::ParseTraceTree;
                            true
                        }
                        Some(_) => self.enter_strings(),
                        None => false,
                    }
                }
                LoaderState::ParseTraceTree => {
                    match self.scan.advance(&self.buffer, b'[', b']') {
                        Some(end) => {
                            self.trace_tree = TraceTree::parse(&self.buffer[..=end])?;
                            self.buffer.drain(..=end);
                            self.state = self.after_traces();
                            true
                        }
                        None => false,
                    }
                }
                LoaderState::AwaitStrings => match self.seek(&[STRINGS_TOKEN], b'[') {
                    Some(_) => self.enter_strings(),
                    None => false,
                },
                LoaderState::AccumulateStrings | LoaderState::Done | LoaderState::Failed => false,
            };
            if !progressed {
                return Ok(());
            }
        }
    }

    fn enter_strings(&mut self) -> bool {
        self.progress.update_status("Loading strings…");
        self.state = LoaderState::AccumulateStrings;
        // Nothing more to parse incrementally; the rest of the payload is
        // buffered until `close`.
        false
    }

    fn expected_len(&self, section: Section) -> usize {
        let Some(header) = &self.header else {
            return 0;
        };
        let meta = &header.meta;
        match section {
            Section::Nodes => header.node_count * meta.node_fields.len(),
            Section::Edges => header.edge_count * meta.edge_fields.len(),
            Section::TraceFunctionInfos => {
                header.trace_function_count * meta.trace_function_info_fields.len()
            }
            Section::Samples | Section::Locations => 0,
        }
    }

    fn store(&mut self, section: Section, values: Vec<u32>) -> LoaderState {
        match section {
            Section::Nodes => {
                self.nodes = values;
                LoaderState::AwaitArray(Section::Edges)
            }
            Section::Edges => {
                self.edges = values;
                let has_traces = self
                    .header
                    .as_ref()
                    .is_some_and(|h| h.trace_function_count > 0);
                if has_traces {
                    LoaderState::AwaitArray(Section::TraceFunctionInfos)
                } else {
                    self.after_traces()
                }
            }
            Section::TraceFunctionInfos => {
                self.trace_function_infos = values;
                LoaderState::AwaitTraceTree
            }
            Section::Samples => {
                self.samples = values;
                self.after_samples()
            }
            Section::Locations => {
                self.locations = values;
                LoaderState::AwaitStrings
            }
        }
    }

    fn after_traces(&self) -> LoaderState {
        let has_samples = self
            .header
            .as_ref()
            .is_some_and(|h| h.meta.sample_fields.is_some());
        if has_samples {
            LoaderState::AwaitArray(Section::Samples)
        } else {
            self.after_samples()
        }
    }

    fn after_samples(&self) -> LoaderState {
        let has_locations = self
            .header
            .as_ref()
            .is_some_and(|h| h.meta.location_fields.is_some());
        if has_locations {
            LoaderState::AwaitArray(Section::Locations)
        } else {
            LoaderState::AwaitStrings
        }
    }

    /// Looks for the earliest of `tokens` followed by `open`. On success the
    /// buffer is trimmed to start at `open` and the index of the matching
    /// token is returned.
    fn seek(&mut self, tokens: &[&[u8]], open: u8) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        for (which, token) in tokens.iter().enumerate() {
            if let Some(pos) = find(&self.buffer, token) {
                if best.is_none_or(|(at, _)| pos < at) {
                    best = Some((pos, which));
                }
            }
        }
        let Some((pos, which)) = best else {
            // Keep only a tail that could still be the start of a token.
            let longest = tokens.iter().map(|t| t.len()).max().unwrap_or(1);
            let keep_from = self.buffer.len().saturating_sub(longest - 1);
            self.buffer.drain(..keep_from);
            return None;
        };
        let after = pos + tokens[which].len();
        match self.buffer[after..].iter().position(|&b| b == open) {
            Some(offset) => {
                self.buffer.drain(..after + offset);
                Some(which)
            }
            None => {
                self.buffer.drain(..pos);
                None
            }
        }
    }

    /// Scans digit runs into `self.array`. Returns `true` once the closing
    /// bracket was consumed; a number cut by the chunk boundary stays in the
    /// buffer for the next round.
    fn parse_uint_array(&mut self, section: Section) -> Result<bool> {
        let buf = &self.buffer;
        let len = buf.len();
        let mut index = 0;
        loop {
            while index < len {
                let b = buf[index];
                if b.is_ascii_digit() {
                    break;
                }
                if b == b']' {
                    self.buffer.drain(..=index);
                    return Ok(true);
                }
                index += 1;
            }
            if index == len {
                self.buffer.clear();
                return Ok(false);
            }
            let start = index;
            let mut value: u64 = 0;
            while index < len && buf[index].is_ascii_digit() {
                value = value * 10 + u64::from(buf[index] - b'0');
                if value > u64::from(u32::MAX) {
                    return Err(LoadError::NumberOutOfRange(section.name()));
                }
                index += 1;
            }
            if index == len {
                self.buffer.drain(..start);
                return Ok(false);
            }
            self.array.push(value as u32);
        }
    }
}

impl Default for Loader {
    fn default() -> Self {
        Self::new()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Parses the `strings` array. Snapshots may contain lone UTF-16 surrogates,
/// which `serde_json` rejects, so escapes are decoded here and unpaired
/// surrogates become U+FFFD.
fn parse_string_array(bytes: &[u8]) -> Result<Vec<String>> {
    let malformed = |offset| LoadError::Malformed {
        section: "strings",
        offset,
    };
    let mut strings = Vec::new();
    let mut i = match bytes.first() {
        Some(b'[') => 1,
        _ => return Err(malformed(0)),
    };
    loop {
        while i < bytes.len() && matches!(bytes[i], b' ' | b'\n' | b'\r' | b'\t' | b',') {
            i += 1;
        }
        match bytes.get(i) {
            None => return Err(LoadError::UnexpectedEnd("strings")),
            Some(b']') => return Ok(strings),
            Some(b'"') => {
                let (value, next) = parse_json_string(bytes, i + 1)?;
                strings.push(value);
                i = next;
            }
            Some(_) => return Err(malformed(i)),
        }
    }
}

/// Decodes one JSON string body starting after its opening quote. Returns
/// the string and the offset just past the closing quote.
fn parse_json_string(bytes: &[u8], start: usize) -> Result<(String, usize)> {
    let mut out: Vec<u8> = Vec::new();
    let mut i = start;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => return Ok((String::from_utf8_lossy(&out).into_owned(), i + 1)),
            b'\\' => {
                let Some(&escape) = bytes.get(i + 1) else {
                    break;
                };
                i += 2;
                let ch = match escape {
                    b'"' => '"',
                    b'\\' => '\\',
                    b'/' => '/',
                    b'b' => '\u{8}',
                    b'f' => '\u{c}',
                    b'n' => '\n',
                    b'r' => '\r',
                    b't' => '\t',
                    b'u' => {
                        let high = read_hex4(bytes, i)?;
                        i += 4;
                        if (0xD800..0xDC00).contains(&high)
                            && bytes.get(i) == Some(&b'\\')
                            && bytes.get(i + 1) == Some(&b'u')
                        {
                            let low = read_hex4(bytes, i + 2)?;
                            if (0xDC00..0xE000).contains(&low) {
                                i += 6;
                                let code = 0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00);
                                char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER)
                            } else {
                                char::REPLACEMENT_CHARACTER
                            }
                        } else {
                            char::from_u32(high).unwrap_or(char::REPLACEMENT_CHARACTER)
                        }
                    }
                    _ => {
                        return Err(LoadError::Malformed {
                            section: "strings",
                            offset: i - 1,
                        });
                    }
                };
                let mut utf8 = [0u8; 4];
                out.extend_from_slice(ch.encode_utf8(&mut utf8).as_bytes());
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    Err(LoadError::UnexpectedEnd("strings"))
}

fn read_hex4(bytes: &[u8], at: usize) -> Result<u32> {
    let digits = bytes
        .get(at..at + 4)
        .ok_or(LoadError::UnexpectedEnd("strings"))?;
    let mut value = 0u32;
    for (k, &d) in digits.iter().enumerate() {
        let nibble = (d as char).to_digit(16).ok_or(LoadError::Malformed {
            section: "strings",
            offset: at + k,
        })?;
        value = value * 16 + nibble;
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{SnapshotBuilder, TraceSpec};
    use std::cell::RefCell;
    use std::io::Cursor;
    use std::rc::Rc;

    fn sample_snapshot() -> String {
        let mut b = SnapshotBuilder::new();
        let root = b.node("synthetic", "", 1, 0);
        let window = b.node("object", "Window", 3, 120);
        let text = b.node("string", "héllo \"world\"", 5, 32);
        b.edge(root, "shortcut", "window", window);
        b.edge(window, "property", "greeting", text);
        b.function_info("(root)", "", 0, 0, 0);
        b.function_info("main", "app.js", 1, 10, 4);
        b.trace_tree(TraceSpec::new(1, 0, 0, 0).child(TraceSpec::new(2, 1, 3, 96)));
        b.samples(&[(1_000, 3), (2_000, 5)]);
        b.to_json()
    }

    fn load_in_chunks(payload: &[u8], chunk: usize) -> RawSnapshot {
        let mut loader = Loader::new();
        for piece in payload.chunks(chunk) {
            loader.write(piece).unwrap();
        }
        loader.close().unwrap()
    }

    #[test]
    fn parses_whole_payload() {
        let raw = Loader::load(Cursor::new(sample_snapshot())).unwrap();
        assert_eq!(raw.header.node_count, 3);
        assert_eq!(raw.nodes.len(), 3 * raw.header.meta.node_fields.len());
        assert_eq!(raw.edges.len(), 2 * 3);
        assert_eq!(raw.trace_function_infos.len(), 2 * 6);
        assert!(!raw.trace_tree.is_empty());
        assert_eq!(raw.samples, vec![1_000, 3, 2_000, 5]);
        assert!(raw.strings.contains(&"héllo \"world\"".to_string()));
    }

    #[test]
    fn split_inside_nodes_parses_identically() {
        let payload = sample_snapshot();
        let whole = load_in_chunks(payload.as_bytes(), payload.len());
        let nodes_at = payload.find("\"nodes\"").unwrap();
        // Cut in the middle of the node array, possibly inside a number.
        for cut in nodes_at + 9..nodes_at + 30 {
            let mut loader = Loader::new();
            loader.write(&payload.as_bytes()[..cut]).unwrap();
            loader.write(&payload.as_bytes()[cut..]).unwrap();
            let split = loader.close().unwrap();
            assert_eq!(split.nodes, whole.nodes);
            assert_eq!(split.edges, whole.edges);
            assert_eq!(split.strings, whole.strings);
        }
    }

    #[test]
    fn byte_sized_chunks_parse_identically() {
        let payload = sample_snapshot();
        let whole = load_in_chunks(payload.as_bytes(), payload.len());
        let tiny = load_in_chunks(payload.as_bytes(), 1);
        assert_eq!(tiny.nodes, whole.nodes);
        assert_eq!(tiny.edges, whole.edges);
        assert_eq!(tiny.trace_function_infos, whole.trace_function_infos);
        assert_eq!(tiny.trace_tree, whole.trace_tree);
        assert_eq!(tiny.samples, whole.samples);
        assert_eq!(tiny.strings, whole.strings);
    }

    #[test]
    fn usable_before_payload_is_complete() {
        let payload = sample_snapshot();
        let edges_at = payload.find("\"edges\"").unwrap();
        let mut loader = Loader::new();
        loader.write(&payload.as_bytes()[..edges_at]).unwrap();
        assert_eq!(loader.state(), LoaderState::AwaitArray(Section::Edges));
    }

    #[test]
    fn missing_strings_is_fatal() {
        let payload = sample_snapshot();
        let strings_at = payload.find("\"strings\"").unwrap();
        let mut loader = Loader::new();
        loader.write(&payload.as_bytes()[..strings_at]).unwrap();
        let err = loader.close().unwrap_err();
        assert!(matches!(err, LoadError::MissingSection("strings")));
        assert!(matches!(loader.write(b"[]"), Err(LoadError::Aborted)));
    }

    #[test]
    fn missing_snapshot_is_fatal() {
        let mut loader = Loader::new();
        loader.write(br#"{"nodes": [1, 2, 3]}"#).unwrap();
        assert!(matches!(
            loader.close(),
            Err(LoadError::MissingSection("snapshot"))
        ));
    }

    #[test]
    fn missing_edges_is_fatal() {
        let payload = sample_snapshot();
        let edges_at = payload.find("\"edges\"").unwrap();
        let mut loader = Loader::new();
        loader.write(&payload.as_bytes()[..edges_at]).unwrap();
        assert!(matches!(
            loader.close(),
            Err(LoadError::MissingSection("edges"))
        ));
    }

    #[test]
    fn out_of_range_number_fails() {
        let payload = sample_snapshot().replacen("\"nodes\":[", "\"nodes\":[99999999999,", 1);
        let mut loader = Loader::new();
        let err = loader.write(payload.as_bytes()).unwrap_err();
        assert!(matches!(err, LoadError::NumberOutOfRange("nodes")));
    }

    #[test]
    fn lone_surrogates_are_replaced() {
        let strings = parse_string_array("[\"a\\ud800b\", \"😀\", \"é\\n\"]".as_bytes()).unwrap();
        assert_eq!(strings, vec!["a\u{fffd}b", "\u{1f600}", "é\n"]);
    }

    #[test]
    fn trace_tree_is_flattened() {
        let tree = TraceTree::parse(b"[1,0,0,0,[2,1,5,100,[],3,2,1,8,[]]]").unwrap();
        let root = tree.root().unwrap();
        assert_eq!(root.len(), 5);
        let TraceItem::Array(children) = root[4] else {
            panic!("children must be an array");
        };
        assert_eq!(tree.array(children).len(), 10);
        assert_eq!(tree.array(children)[2], TraceItem::Number(5));
    }

    #[test]
    fn deep_trace_tree_does_not_recurse() {
        let depth = 5_000;
        let mut text = String::new();
        for i in 0..depth {
            text.push_str(&format!("[{},1,1,1,", i + 1));
        }
        text.push_str("[]");
        for _ in 0..depth {
            text.push(']');
        }
        let tree = TraceTree::parse(text.as_bytes()).unwrap();
        assert_eq!(tree.arrays.len(), depth + 1);
    }

    #[derive(Default)]
    struct Recorder(Rc<RefCell<Vec<String>>>);

    impl Progress for Recorder {
        fn update_status(&self, status: &str) {
            self.0.borrow_mut().push(status.to_string());
        }
        fn update_progress(&self, title: &str, value: usize, total: usize) {
            self.0
                .borrow_mut()
                .push(format!("{} {}%", title, percent(value, total)));
        }
        fn report_problem(&self, message: &str) {
            self.0.borrow_mut().push(format!("problem: {}", message));
        }
    }

    #[test]
    fn reports_progress() {
        let events = Rc::new(RefCell::new(Vec::new()));
        let mut loader = Loader::with_progress(Box::new(Recorder(events.clone())));
        loader.write(sample_snapshot().as_bytes()).unwrap();
        loader.close().unwrap();
        let events = events.borrow();
        assert!(events.iter().any(|e| e == "Loading snapshot info…"));
        assert!(events.iter().any(|e| e == "Loading strings…"));
    }
}
