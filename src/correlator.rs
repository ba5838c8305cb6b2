//! L4 — Transcript Correlator: tails append-only transcript files beneath a
//! configurable root and joins file-save events to recent tool-use
//! activity within a bounded time window.
//!
//! The tailing loop mirrors the reference daemon's line-oriented JSON event
//! reader (`session/claude.rs`'s `BufReader` loop over a `claude` child's
//! stdout), applied here to on-disk files discovered by the same
//! `notify-debouncer-full` stack the reference daemon uses for repo/config
//! watching instead of to a live subprocess.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolName {
    Edit,
    Write,
}

#[derive(Debug, Clone)]
pub struct TranscriptToolUse {
    pub path: PathBuf,
    pub session_id: String,
    pub detected_at: DateTime<Utc>,
    pub tool: ToolName,
    /// First non-blank textual line carried alongside the tool-use record,
    /// if the transcript exposed one — used only for commit-message
    /// composition (M1 §4.6), never persisted or compared for correlation.
    pub text: Option<String>,
}

struct SessionRing {
    entries: VecDeque<TranscriptToolUse>,
}

impl SessionRing {
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    fn push(&mut self, entry: TranscriptToolUse, capacity: usize) {
        self.entries.push_back(entry);
        while self.entries.len() > capacity {
            self.entries.pop_front();
        }
    }

    fn evict_older_than(&mut self, cutoff: DateTime<Utc>) {
        while let Some(front) = self.entries.front() {
            if front.detected_at < cutoff {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct CorrelationMatch {
    pub session_id: String,
    pub confidence: f64,
    pub text: Option<String>,
}

/// Bounded LRU of tailing offsets, one entry per watched transcript file.
/// A plain `HashMap` has no iteration order guarantee, so eviction needs its
/// own recency queue rather than picking an arbitrary key on overflow.
struct OffsetTracker {
    offsets: HashMap<PathBuf, u64>,
    recency: VecDeque<PathBuf>,
    capacity: usize,
}

impl OffsetTracker {
    fn new(capacity: usize) -> Self {
        Self {
            offsets: HashMap::new(),
            recency: VecDeque::new(),
            capacity,
        }
    }

    fn note(&mut self, path: &Path, offset: u64) {
        if self.offsets.contains_key(path) {
            self.recency.retain(|p| p != path);
        } else if self.offsets.len() >= self.capacity {
            if let Some(oldest) = self.recency.pop_front() {
                self.offsets.remove(&oldest);
            }
        }
        self.recency.push_back(path.to_path_buf());
        self.offsets.insert(path.to_path_buf(), offset);
    }

    fn get(&self, path: &Path) -> u64 {
        self.offsets.get(path).copied().unwrap_or(0)
    }

    fn len(&self) -> usize {
        self.offsets.len()
    }
}

pub struct Correlator {
    rings: RwLock<HashMap<String, SessionRing>>,
    window: chrono::Duration,
    slack: chrono::Duration,
    ring_capacity: usize,
    offsets: RwLock<OffsetTracker>,
}

impl Correlator {
    pub fn new(window_secs: i64, slack_secs: i64, ring_capacity: usize, max_tailed_files: usize) -> Self {
        Self {
            rings: RwLock::new(HashMap::new()),
            window: chrono::Duration::seconds(window_secs),
            slack: chrono::Duration::seconds(slack_secs),
            ring_capacity,
            offsets: RwLock::new(OffsetTracker::new(max_tailed_files)),
        }
    }

    pub fn window_secs(&self) -> i64 {
        self.window.num_seconds()
    }

    /// Record one observed tool-use record.
    pub async fn record(&self, entry: TranscriptToolUse) {
        let cutoff = Utc::now() - (self.window + self.slack);
        let mut rings = self.rings.write().await;
        let ring = rings
            .entry(entry.session_id.clone())
            .or_insert_with(SessionRing::new);
        ring.push(entry, self.ring_capacity);
        ring.evict_older_than(cutoff);
    }

    /// Most recent tool-use whose path equals `path` and whose age is
    /// within the correlation window. Deterministic tie-break: latest
    /// timestamp, then lexicographically smaller session id.
    pub async fn find(&self, path: &Path, now: DateTime<Utc>) -> Option<CorrelationMatch> {
        let rings = self.rings.read().await;
        let mut best: Option<&TranscriptToolUse> = None;

        for ring in rings.values() {
            for candidate in ring.entries.iter().rev() {
                if candidate.path != path {
                    continue;
                }
                let age = now - candidate.detected_at;
                if age < chrono::Duration::zero() || age > self.window {
                    continue;
                }
                best = Some(match best {
                    None => candidate,
                    Some(current) => pick_better(current, candidate),
                });
                break;
            }
        }

        best.map(|entry| {
            let age_ms = (now - entry.detected_at).num_milliseconds().max(0) as f64;
            let window_ms = self.window.num_milliseconds() as f64;
            let confidence = (1.0 - age_ms / window_ms).clamp(0.0, 1.0);
            CorrelationMatch {
                session_id: entry.session_id.clone(),
                confidence,
                text: entry.text.clone(),
            }
        })
    }

    /// Tracks which files we've already tailed, evicting the
    /// least-recently-updated entry once `max_tailed_files` is exceeded.
    pub async fn note_offset(&self, path: &Path, offset: u64) {
        self.offsets.write().await.note(path, offset);
    }

    pub async fn offset_for(&self, path: &Path) -> u64 {
        self.offsets.read().await.get(path)
    }

    #[cfg(test)]
    async fn tailed_file_count(&self) -> usize {
        self.offsets.read().await.len()
    }
}

fn pick_better<'a>(a: &'a TranscriptToolUse, b: &'a TranscriptToolUse) -> &'a TranscriptToolUse {
    if b.detected_at > a.detected_at {
        b
    } else if b.detected_at < a.detected_at {
        a
    } else if b.session_id < a.session_id {
        b
    } else {
        a
    }
}

/// Parses one trailing JSONL record. Unrecognized shapes are ignored
/// rather than rejected (per spec.md §9 "dynamic JSON values" note).
pub fn parse_tool_use_line(line: &str) -> Option<TranscriptToolUse> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    let session_id = value.get("session_id")?.as_str()?.to_string();
    let timestamp = value.get("timestamp")?.as_str()?;
    let detected_at = DateTime::parse_from_rfc3339(timestamp)
        .ok()?
        .with_timezone(&Utc);
    let tool_use = value.get("tool_use")?;
    let tool_name = tool_use.get("tool")?.as_str()?;
    let tool = match tool_name {
        "Edit" => ToolName::Edit,
        "Write" => ToolName::Write,
        _ => return None,
    };
    let path = tool_use.get("file_path")?.as_str()?;
    let text = tool_use
        .get("text")
        .or_else(|| tool_use.get("new_string"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    Some(TranscriptToolUse {
        path: PathBuf::from(path),
        session_id,
        detected_at,
        tool,
        text,
    })
}

/// Tail every newly-appended, complete line in `file` since the last known
/// offset, feeding each parsed record into `correlator`. Malformed lines
/// are skipped silently; at most one warning is logged per file per call.
pub async fn tail_file(correlator: &Arc<Correlator>, path: &Path) -> std::io::Result<()> {
    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    let start = correlator.offset_for(path).await;
    if len <= start {
        return Ok(());
    }

    file.seek(std::io::SeekFrom::Start(start)).await?;
    let mut buf = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut buf).await?;

    let text = String::from_utf8_lossy(&buf);
    let mut consumed = 0usize;
    let mut warned = false;
    for line in text.split_inclusive('\n') {
        if !line.ends_with('\n') {
            break; // incomplete trailing line — retried on the next tail
        }
        consumed += line.len();
        match parse_tool_use_line(line.trim_end()) {
            Some(entry) => correlator.record(entry).await,
            None if line.trim().is_empty() => {}
            None if !warned => {
                warn!(path = %path.display(), "skipping malformed transcript record");
                warned = true;
            }
            None => {}
        }
    }

    correlator.note_offset(path, start + consumed as u64).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, session: &str, secs_ago: i64) -> TranscriptToolUse {
        TranscriptToolUse {
            path: PathBuf::from(path),
            session_id: session.to_string(),
            detected_at: Utc::now() - chrono::Duration::seconds(secs_ago),
            tool: ToolName::Edit,
            text: Some("fixed the off-by-one in the paginator".to_string()),
        }
    }

    #[tokio::test]
    async fn finds_recent_match_with_decayed_confidence() {
        let correlator = Correlator::new(10, 5, 64, 256);
        correlator.record(entry("/repo/src/a.ts", "S1", 3)).await;

        let matched = correlator
            .find(Path::new("/repo/src/a.ts"), Utc::now())
            .await
            .unwrap();
        assert_eq!(matched.session_id, "S1");
        assert!((matched.confidence - 0.7).abs() < 0.05);
    }

    #[tokio::test]
    async fn expired_entry_does_not_match() {
        let correlator = Correlator::new(10, 0, 64, 256);
        correlator.record(entry("/repo/src/a.ts", "S1", 20)).await;
        // Outside window + slack, so eviction already dropped it.
        assert!(correlator.find(Path::new("/repo/src/a.ts"), Utc::now()).await.is_none());
    }

    #[tokio::test]
    async fn tie_break_prefers_latest_then_smaller_session_id() {
        let correlator = Correlator::new(10, 5, 64, 256);
        let now = Utc::now() - chrono::Duration::seconds(2);
        correlator
            .record(TranscriptToolUse {
                path: PathBuf::from("/repo/a.ts"),
                session_id: "zzz".to_string(),
                detected_at: now,
                tool: ToolName::Edit,
                text: None,
            })
            .await;
        correlator
            .record(TranscriptToolUse {
                path: PathBuf::from("/repo/a.ts"),
                session_id: "aaa".to_string(),
                detected_at: now,
                tool: ToolName::Write,
                text: None,
            })
            .await;

        let matched = correlator.find(Path::new("/repo/a.ts"), Utc::now()).await.unwrap();
        assert_eq!(matched.session_id, "aaa");
    }

    #[test]
    fn parses_minimal_tool_use_record() {
        let line = r#"{"session_id":"S1","timestamp":"2026-01-01T00:00:00Z","tool_use":{"tool":"Write","file_path":"/repo/a.ts"}}"#;
        let parsed = parse_tool_use_line(line).unwrap();
        assert_eq!(parsed.session_id, "S1");
        assert_eq!(parsed.tool, ToolName::Write);
    }

    #[test]
    fn ignores_unrecognized_shape() {
        let line = r#"{"kind":"assistant_message","text":"hi"}"#;
        assert!(parse_tool_use_line(line).is_none());
    }

    #[tokio::test]
    async fn tailed_offsets_evict_the_least_recently_used_entry() {
        let correlator = Correlator::new(10, 5, 64, 2);
        correlator.note_offset(Path::new("/repo/a.jsonl"), 10).await;
        correlator.note_offset(Path::new("/repo/b.jsonl"), 20).await;
        // Touching a.jsonl again marks it more recent than b.jsonl.
        correlator.note_offset(Path::new("/repo/a.jsonl"), 11).await;
        correlator.note_offset(Path::new("/repo/c.jsonl"), 30).await;

        assert_eq!(correlator.tailed_file_count().await, 2);
        assert_eq!(correlator.offset_for(Path::new("/repo/a.jsonl")).await, 11);
        assert_eq!(correlator.offset_for(Path::new("/repo/c.jsonl")).await, 30);
        // b.jsonl was least recently used and should have been evicted.
        assert_eq!(correlator.offset_for(Path::new("/repo/b.jsonl")).await, 0);
    }
}
