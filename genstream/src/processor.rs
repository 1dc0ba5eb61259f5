//! Incremental markdown sectioning of a growing generation buffer
//!
//! Each chunk only re-scans the text from the start of the first section
//! whose end is not yet known. A section is closed, and never scanned again,
//! once the heading line of the section after it is complete.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::debug;

/// Upper bound for estimated progress before the stream completes
const MAX_STREAMING_PROGRESS: usize = 95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingPhase {
    /// No content yet
    Initializing,
    /// Content is arriving but no section is closed
    Structuring,
    /// At least one section is closed
    Refining,
    Complete,
}

/// Coarse classification of a section by its title
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionKind {
    Overview,
    Phases,
    Tasks,
    Resources,
    Risks,
    Kpis,
    Timeline,
    Other,
}

impl SectionKind {
    pub fn classify(title: &str) -> Self {
        const RULES: &[(&[&str], SectionKind)] = &[
            (&["overview", "summary", "introduction", "executive"], SectionKind::Overview),
            (&["phase", "roadmap", "milestone"], SectionKind::Phases),
            (&["task", "action", "step", "deliverable"], SectionKind::Tasks),
            (&["resource", "budget", "team", "tool"], SectionKind::Resources),
            (&["risk", "mitigation", "challenge"], SectionKind::Risks),
            (&["kpi", "metric", "success", "measure"], SectionKind::Kpis),
            (&["timeline", "schedule"], SectionKind::Timeline),
        ];

        let title = title.to_lowercase();
        RULES
            .iter()
            .find(|(keywords, _)| keywords.iter().any(|k| title.contains(k)))
            .map(|(_, kind)| *kind)
            .unwrap_or(SectionKind::Other)
    }
}

/// A heading-delimited section of the output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedSection {
    pub title: String,
    /// Heading depth; `0` for text before the first heading
    pub level: u8,
    pub kind: SectionKind,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Section count at which the structural half of progress saturates
    pub expected_sections: usize,
    /// Buffer length at which the length half of progress saturates
    pub expected_length: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            expected_sections: 6,
            expected_length: 6_000,
        }
    }
}

/// Result of feeding one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentUpdate {
    pub phase: ProcessingPhase,
    pub progress: u8,
    pub section_count: usize,
    /// Whether this chunk closed at least one section
    pub closed_sections: bool,
}

#[derive(Debug)]
pub struct IncrementalContentProcessor {
    config: ProcessorConfig,
    buffer: String,
    /// Sections whose content can no longer change
    closed: Vec<ProcessedSection>,
    /// Byte offset where the still-open region starts
    open_start: usize,
    /// Sections derived from the open region on the last scan
    open: Vec<ProcessedSection>,
    phase: ProcessingPhase,
    progress: u8,
}

impl Default for IncrementalContentProcessor {
    fn default() -> Self {
        Self::new(ProcessorConfig::default())
    }
}

impl IncrementalContentProcessor {
    pub fn new(config: ProcessorConfig) -> Self {
        Self {
            config,
            buffer: String::new(),
            closed: Vec::new(),
            open_start: 0,
            open: Vec::new(),
            phase: ProcessingPhase::Initializing,
            progress: 0,
        }
    }

    /// Append a chunk and re-derive the open sections
    pub fn process_chunk(&mut self, chunk: &str) -> ContentUpdate {
        self.buffer.push_str(chunk);

        let closed_before = self.closed.len();
        self.rescan();
        let closed_sections = self.closed.len() > closed_before;

        if self.phase != ProcessingPhase::Complete {
            self.phase = if !self.closed.is_empty() {
                ProcessingPhase::Refining
            } else if self.buffer.trim().is_empty() {
                ProcessingPhase::Initializing
            } else {
                ProcessingPhase::Structuring
            };
            self.update_progress();
        }

        ContentUpdate {
            phase: self.phase,
            progress: self.progress,
            section_count: self.section_count(),
            closed_sections,
        }
    }

    /// Mark the stream finished; progress becomes 100
    pub fn complete(&mut self) -> ContentUpdate {
        self.phase = ProcessingPhase::Complete;
        self.progress = 100;
        ContentUpdate {
            phase: self.phase,
            progress: self.progress,
            section_count: self.section_count(),
            closed_sections: false,
        }
    }

    /// Clear all state for reuse by another session
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.closed.clear();
        self.open.clear();
        self.open_start = 0;
        self.phase = ProcessingPhase::Initializing;
        self.progress = 0;
    }

    /// Closed sections followed by the currently open ones
    pub fn sections(&self) -> Vec<ProcessedSection> {
        self.closed.iter().chain(self.open.iter()).cloned().collect()
    }

    pub fn section_count(&self) -> usize {
        self.closed.len() + self.open.len()
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn phase(&self) -> ProcessingPhase {
        self.phase
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    fn rescan(&mut self) {
        let region = &self.buffer[self.open_start..];
        let blocks = scan_blocks(region);

        // The last block whose heading line is complete closes everything before it.
        let boundary = blocks
            .iter()
            .enumerate()
            .skip(1)
            .rev()
            .find(|(_, block)| block.heading_complete)
            .map(|(i, _)| i);

        let mut blocks = blocks.into_iter();
        if let Some(boundary) = boundary {
            let mut consumed = 0;
            for block in blocks.by_ref().take(boundary) {
                consumed = block.start + block.len;
                if let Some(section) = block.into_section() {
                    self.closed.push(section);
                }
            }
            self.open_start += consumed;
        }

        self.open = blocks.filter_map(Block::into_section).collect();
    }

    fn update_progress(&mut self) {
        let expected_sections = self.config.expected_sections.max(1);
        let expected_length = self.config.expected_length.max(1);

        let estimate = 50 * self.section_count() / expected_sections
            + 50 * self.buffer.len() / expected_length;
        let estimate = estimate.min(MAX_STREAMING_PROGRESS) as u8;

        self.progress = self.progress.max(estimate);
    }
}

/// A heading (or the preamble) plus the lines up to the next heading
struct Block {
    start: usize,
    len: usize,
    heading_complete: bool,
    level: u8,
    title: String,
    content: String,
}

impl Block {
    fn into_section(self) -> Option<ProcessedSection> {
        let content = self.content.trim().to_string();
        if self.level == 0 && content.is_empty() {
            return None;
        }
        Some(ProcessedSection {
            kind: SectionKind::classify(&self.title),
            title: self.title,
            level: self.level,
            content,
        })
    }
}

fn scan_blocks(text: &str) -> Vec<Block> {
    let mut blocks = vec![Block {
        start: 0,
        len: 0,
        heading_complete: true,
        level: 0,
        title: String::new(),
        content: String::new(),
    }];
    let mut offset = 0;
    let mut in_fence = false;

    for line in text.split_inclusive('\n') {
        let body = line.trim_end_matches(['\n', '\r']);

        let heading = if in_fence { None } else { parse_heading(body) };
        match heading {
            Some((level, title)) => blocks.push(Block {
                start: offset,
                len: line.len(),
                heading_complete: line.ends_with('\n'),
                level,
                title,
                content: String::new(),
            }),
            None => {
                if body.trim_start().starts_with("```") {
                    in_fence = !in_fence;
                }
                if let Some(block) = blocks.last_mut() {
                    block.content.push_str(line);
                    block.len += line.len();
                }
            }
        }

        offset += line.len();
    }

    blocks
}

/// `#`..`######` followed by whitespace
fn parse_heading(line: &str) -> Option<(u8, String)> {
    let level = line.bytes().take_while(|b| *b == b'#').count();
    if level == 0 || level > 6 {
        return None;
    }

    let rest = &line[level..];
    if !rest.starts_with([' ', '\t']) {
        return None;
    }

    let title = rest.trim().trim_end_matches('#').trim_end();
    Some((level as u8, title.to_string()))
}

/// Reusable processors, so buffers are not reallocated for every session
#[derive(Debug)]
pub struct ProcessorPool {
    config: ProcessorConfig,
    idle: Mutex<Vec<IncrementalContentProcessor>>,
    max_idle: usize,
}

impl ProcessorPool {
    pub fn new(config: ProcessorConfig, max_idle: usize) -> Self {
        Self {
            config,
            idle: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    pub fn acquire(&self) -> IncrementalContentProcessor {
        let recycled = self.idle.lock().unwrap_or_else(|e| e.into_inner()).pop();
        recycled.unwrap_or_else(|| IncrementalContentProcessor::new(self.config))
    }

    pub fn release(&self, mut processor: IncrementalContentProcessor) {
        processor.reset();
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        if idle.len() < self.max_idle {
            idle.push(processor);
        } else {
            debug!("Processor pool full, dropping processor");
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
