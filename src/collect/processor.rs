use super::pool::TaskProcessor;
use super::writer::{CompositeWriter, ResultWriter};
use super::{ContentReader, FileData, FileInfo, JobResults, Location, LogEvent, LogPattern};
use crate::error::{CollectError, Stopped};
use crate::fs::FileServiceSelector;
use anyhow::Result;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::io::{self, BufRead, BufReader, Read};
use std::sync::Arc;
use tracing::{debug, warn};

const EVENT_BATCH: usize = 256;

/// Decides which lines of a file become events
#[derive(Debug, Clone)]
pub struct LineMatcher {
    regex: Option<Regex>,
    search: Option<String>,
    timestamp_format: Option<String>,
}

impl LineMatcher {
    pub fn new(pattern: &LogPattern, search: Option<&str>) -> Result<Self, CollectError> {
        let regex = pattern
            .line_regex
            .as_deref()
            .filter(|r| !r.is_empty())
            .map(|r| {
                Regex::new(r).map_err(|e| CollectError::InvalidPattern {
                    pattern: r.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()?;

        Ok(Self {
            regex,
            search: search.filter(|s| !s.is_empty()).map(str::to_string),
            timestamp_format: pattern.timestamp_format.clone().filter(|f| !f.is_empty()),
        })
    }

    /// False in plain collection mode, where files are taken whole
    pub fn is_filtering(&self) -> bool {
        self.regex.is_some() || self.search.is_some()
    }

    pub fn matches(&self, line: &str) -> bool {
        self.regex.as_ref().map_or(true, |r| r.is_match(line))
            && self.search.as_deref().map_or(true, |s| line.contains(s))
    }

    /// Leading timestamp of `line`, read as local time
    pub fn timestamp(&self, line: &str) -> Option<DateTime<Utc>> {
        let format = self.timestamp_format.as_deref()?;
        let (naive, _) = NaiveDateTime::parse_and_remainder(line, format).ok()?;
        Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Matches one file's lines and decides whether it gets packaged
pub struct FileProcessor {
    services: Arc<FileServiceSelector>,
    locations: Arc<HashMap<String, Arc<Location>>>,
    matcher: Arc<LineMatcher>,
    results: JobResults,
    packaging: bool,
    package_all: bool,
}

impl FileProcessor {
    pub fn new(
        services: Arc<FileServiceSelector>,
        locations: Arc<HashMap<String, Arc<Location>>>,
        matcher: Arc<LineMatcher>,
        results: JobResults,
    ) -> Self {
        Self {
            services,
            locations,
            matcher,
            results,
            packaging: false,
            package_all: false,
        }
    }

    /// Emit `FileData` for qualifying files; `package_all` takes unmatched files too
    pub fn with_packaging(mut self, package_all: bool) -> Self {
        self.packaging = true;
        self.package_all = package_all;
        self
    }

    pub fn process(&self, file: &FileInfo) -> Option<FileData> {
        let Some(location) = self.locations.get(&file.location_code) else {
            warn!("{}: unknown location for {}", file.location_code, file.path.display());
            self.results.inc_processed_files();
            return None;
        };
        let reader = ContentReader::new(self.services.clone(), location.clone(), file.clone())
            .stop_on(self.results.clone());

        let matched = if self.matcher.is_filtering() {
            match self.match_lines(&reader, file) {
                Ok(found) => {
                    let matched = found.matched;
                    self.publish(found);
                    matched
                }
                Err(e) if Stopped::matches(&e) => {
                    debug!("{} {}: interrupted by stop", file.location_code, file.path.display());
                    self.results.inc_processed_files();
                    return None;
                }
                Err(e) => {
                    warn!("{} {}: skipped: {}", file.location_code, file.path.display(), e);
                    self.results.inc_processed_files();
                    return None;
                }
            }
        } else {
            true
        };

        self.results.inc_processed_files();
        if matched {
            self.results.inc_selected_files();
        }

        if self.packaging && (matched || self.package_all) {
            Some(FileData::new(reader))
        } else {
            None
        }
    }

    /// Read the whole file before anything reaches the aggregator, so a file
    /// that fails halfway leaves no events behind
    fn match_lines(&self, reader: &ContentReader, file: &FileInfo) -> io::Result<FileMatches> {
        let mut lines = BufReader::new(decode(reader.open()?, file));
        let mut buf = Vec::new();
        let mut line_no = 0u64;
        let mut found = FileMatches::default();
        let keep = self.results.capacity();

        loop {
            buf.clear();
            if lines.read_until(b'\n', &mut buf)? == 0 {
                break;
            }
            line_no += 1;

            let text = String::from_utf8_lossy(&buf);
            let text = text.trim_end_matches(['\r', '\n']);
            if !self.matcher.matches(text) {
                continue;
            }

            found.matched = true;
            // Older events would be evicted from the buffer anyway
            if found.events.len() == keep {
                found.events.pop_front();
                found.discarded += 1;
            }
            found.events.push_back(LogEvent {
                timestamp: self.matcher.timestamp(text).unwrap_or(file.modified),
                file: file.path.clone(),
                location_code: file.location_code.clone(),
                host: file.host.clone(),
                line: line_no,
                text: text.to_string(),
            });
        }

        Ok(found)
    }

    fn publish(&self, found: FileMatches) {
        self.results.add_discarded(found.discarded);
        let mut events = Vec::from(found.events);
        while !events.is_empty() {
            let rest = events.split_off(events.len().min(EVENT_BATCH));
            self.results.add_all(events);
            events = rest;
        }
    }
}

/// Matches of one completely read file
#[derive(Debug, Default)]
struct FileMatches {
    matched: bool,
    events: VecDeque<LogEvent>,
    discarded: u64,
}

#[cfg(feature = "compression")]
fn decode(input: Box<dyn Read + Send>, file: &FileInfo) -> Box<dyn Read + Send> {
    if file.relative_path.ends_with(".gz") {
        Box::new(flate2::read::MultiGzDecoder::new(input))
    } else {
        input
    }
}

#[cfg(not(feature = "compression"))]
fn decode(input: Box<dyn Read + Send>, _file: &FileInfo) -> Box<dyn Read + Send> {
    input
}

/// Stage-2 pool task: process one file and hand it to the sinks
pub struct ProcessTask {
    processor: FileProcessor,
    writer: Arc<CompositeWriter>,
}

impl ProcessTask {
    pub fn new(processor: FileProcessor, writer: Arc<CompositeWriter>) -> Self {
        Self { processor, writer }
    }
}

impl TaskProcessor<FileInfo> for ProcessTask {
    fn process_task(&self, worker_id: usize, file: FileInfo) -> Result<()> {
        if self.processor.results.is_stopping() {
            debug!("Worker {} skipping {}: job stopping", worker_id, file.path.display());
            return Ok(());
        }

        if let Some(data) = self.processor.process(&file) {
            if let Err(e) = self.writer.write(&data) {
                if e.is_stopped() {
                    debug!("Worker {} dropped {}: job stopping", worker_id, data.zip_path);
                    return Ok(());
                }
                return Err(e.into());
            }
        }
        Ok(())
    }
}
