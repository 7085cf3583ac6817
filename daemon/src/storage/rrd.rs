//! Round-robin archive files
//!
//! One binary file per target holds the target's entire history at every
//! configured resolution: a fixed header, per-archive consolidation
//! state, and per-archive circular arrays of f64 buckets for the two
//! data sources `latency` (milliseconds, NaN on loss) and `loss`
//! (0..=1). A bucket's slot is its bucket index modulo the archive's row
//! count, so the file never grows and never needs compaction.
//!
//! Raw samples arrive once per base step. Each archive accumulates them
//! into a consolidated bucket (average/min/max/last) and closes the
//! bucket when its last sample arrives or a later sample forces it.
//! A closed bucket whose unknown fraction exceeds the xFilesFactor is
//! itself unknown. Gaps between updates become unknown samples once they
//! exceed the heartbeat (three base steps); shorter gaps inherit the new
//! gauge value.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use tracing::debug;

use shared::config::Aggregation;
use shared::metrics::DataPoint;
use shared::PulseError;

use super::retention::{parse_retention, RraConfig};

const MAGIC: &[u8; 4] = b"PLSA";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: u64 = 48;
const ARCHIVE_HEADER_LEN: u64 = 80;

/// Data source indices within a row
const DS_LATENCY: usize = 0;
const DS_LOSS: usize = 1;
const DS_COUNT: usize = 2;

/// Round-robin archive storage for all targets.
///
/// Every target gets one updater guarding its file, so concurrent
/// rounds can never interleave writes within a single archive.
pub struct RrdStorage {
    data_dir: PathBuf,
    step: Duration,
    heartbeat: Duration,
    xff: f64,
    aggregation: Aggregation,
    rras: Vec<RraConfig>,
    handles: Mutex<HashMap<String, Arc<Mutex<RrdFile>>>>,
}

impl RrdStorage {
    /// Create archive storage rooted at `data_dir`.
    pub fn new(
        data_dir: impl Into<PathBuf>,
        step: Duration,
        retention: &str,
        xff: f64,
        aggregation: Aggregation,
    ) -> Result<Self> {
        let rras = parse_retention(retention, step).context("failed to parse retentions")?;

        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        Ok(RrdStorage {
            data_dir,
            step,
            // Heartbeat is 3x step for tolerance
            heartbeat: step * 3,
            xff,
            aggregation,
            rras,
            handles: Mutex::new(HashMap::new()),
        })
    }

    /// Store one sample for a target. On loss the latency source gets
    /// NaN and the loss source 1.0. A sample addressed at or before the
    /// archive's last bucket is dropped silently.
    pub fn write(
        &self,
        target: &str,
        timestamp: DateTime<Utc>,
        latency_ms: f64,
        is_loss: bool,
    ) -> Result<()> {
        let (latency, loss) = if is_loss {
            (f64::NAN, 1.0)
        } else {
            (latency_ms, 0.0)
        };

        let handle = self.handle_for(target)?;
        let mut file = handle.lock().unwrap_or_else(|e| e.into_inner());
        file.write(timestamp.timestamp(), latency, loss)
            .map_err(|e| PulseError::Storage(format!("failed to update archive: {}", e)))?;
        Ok(())
    }

    /// Fetch consolidated data points for `[from, to]`, choosing the
    /// archive whose resolution best matches the span. Buckets outside
    /// the retained window come back as NaN. A target that was never
    /// written yields an empty sequence, not an error.
    pub fn fetch(
        &self,
        target: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DataPoint>> {
        let path = self.filename(target);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let handle = self.handle_for(target)?;
        let file = handle.lock().unwrap_or_else(|e| e.into_inner());
        file.fetch(from.timestamp(), to.timestamp())
            .map_err(|e| PulseError::Storage(format!("failed to fetch data: {}", e)).into())
    }

    /// Drop all open updaters. Files are consistent after every write,
    /// so there is nothing to flush.
    pub fn close(&self) {
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Archive file path for a target.
    pub fn filename(&self, target: &str) -> PathBuf {
        self.data_dir
            .join(format!("{}.rrd", sanitize_target_name(target)))
    }

    fn handle_for(&self, target: &str) -> Result<Arc<Mutex<RrdFile>>> {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = handles.get(target) {
            return Ok(Arc::clone(handle));
        }

        let path = self.filename(target);
        let file = if path.exists() {
            RrdFile::open(&path)
                .map_err(|e| PulseError::Storage(format!("failed to open archive: {}", e)))?
        } else {
            debug!(target_name = %target, path = %path.display(), "creating archive file");
            RrdFile::create(
                &path,
                self.step.as_secs().max(1),
                self.heartbeat.as_secs(),
                self.xff,
                self.aggregation,
                &self.rras,
            )
            .map_err(|e| PulseError::Storage(format!("failed to create archive: {}", e)))?
        };

        let handle = Arc::new(Mutex::new(file));
        handles.insert(target.to_string(), Arc::clone(&handle));
        Ok(handle)
    }
}

/// Sanitize a target name into an archive file stem.
///
/// The output contains only `[a-z0-9_]`, has no leading/trailing or
/// doubled underscores, is at most 200 bytes, and falls back to
/// `unnamed` when nothing survives. The transform is idempotent.
pub fn sanitize_target_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_underscore = true; // suppress leading underscores
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            prev_underscore = false;
        } else if !prev_underscore {
            out.push('_');
            prev_underscore = true;
        }
    }
    out.truncate(200);
    while out.ends_with('_') {
        out.pop();
    }
    if out.is_empty() {
        out = "unnamed".to_string();
    }
    out
}

/// Consolidation scratch state for one data source of one archive
#[derive(Debug, Clone, Copy, Default)]
struct CdpAcc {
    value: f64,
    known: u64,
    unknown: u64,
}

/// One archive's shape, position and scratch state
#[derive(Debug, Clone)]
struct ArchiveState {
    steps: u64,
    rows: u64,
    /// Bucket currently accumulating; -1 before the first write
    cur_cdp: i64,
    /// Highest bucket written to its row; -1 before the first close
    last_row_cdp: i64,
    acc: [CdpAcc; DS_COUNT],
    /// Byte offset of this archive's latency rows; loss rows follow
    data_offset: u64,
}

impl ArchiveState {
    fn bucket_secs(&self, step: u64) -> i64 {
        (self.steps * step) as i64
    }

    /// Whether a bucket is inside the retained window.
    fn retains(&self, cdp: i64) -> bool {
        self.last_row_cdp >= 0
            && cdp <= self.last_row_cdp
            && cdp > self.last_row_cdp - self.rows as i64
    }
}

/// An open archive file with its header state mirrored in memory.
/// Rows are written in place as buckets close; the header block is
/// rewritten after every sample so a reopened file resumes exactly
/// where it stopped.
struct RrdFile {
    file: File,
    step: u64,
    heartbeat: u64,
    xff: f64,
    consolidation: Aggregation,
    last_pdp: i64,
    archives: Vec<ArchiveState>,
}

impl RrdFile {
    fn create(
        path: &Path,
        step: u64,
        heartbeat: u64,
        xff: f64,
        consolidation: Aggregation,
        rras: &[RraConfig],
    ) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        let mut offset = HEADER_LEN + rras.len() as u64 * ARCHIVE_HEADER_LEN;
        let archives: Vec<ArchiveState> = rras
            .iter()
            .map(|rra| {
                let state = ArchiveState {
                    steps: rra.steps,
                    rows: rra.rows,
                    cur_cdp: -1,
                    last_row_cdp: -1,
                    acc: [CdpAcc::default(); DS_COUNT],
                    data_offset: offset,
                };
                offset += rra.rows * 8 * DS_COUNT as u64;
                state
            })
            .collect();

        let mut rrd = RrdFile {
            file,
            step,
            heartbeat,
            xff,
            consolidation,
            last_pdp: -1,
            archives,
        };

        // Initialize every row of every data source to unknown
        for k in 0..rrd.archives.len() {
            rrd.fill_all_rows(k, [f64::NAN, f64::NAN])?;
        }
        rrd.persist_header()?;
        Ok(rrd)
    }

    fn open(path: &Path) -> io::Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut header = vec![0u8; HEADER_LEN as usize];
        file.read_exact(&mut header)?;

        if &header[0..4] != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "not a pulse archive file",
            ));
        }
        let version = read_u32(&header[4..8]);
        if version != FORMAT_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported archive version {}", version),
            ));
        }

        let step = read_u64(&header[8..16]);
        let heartbeat = read_u64(&header[16..24]);
        let xff = read_f64(&header[24..32]);
        let consolidation = match header[32] {
            0 => Aggregation::Average,
            1 => Aggregation::Min,
            2 => Aggregation::Max,
            3 => Aggregation::Last,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown consolidation code {}", other),
                ));
            }
        };
        let archive_count = read_u32(&header[36..40]) as usize;
        let last_pdp = read_i64(&header[40..48]);

        let mut archive_headers = vec![0u8; archive_count * ARCHIVE_HEADER_LEN as usize];
        file.read_exact(&mut archive_headers)?;

        let mut offset = HEADER_LEN + archive_count as u64 * ARCHIVE_HEADER_LEN;
        let mut archives = Vec::with_capacity(archive_count);
        for k in 0..archive_count {
            let h = &archive_headers[k * ARCHIVE_HEADER_LEN as usize..];
            let steps = read_u64(&h[0..8]);
            let rows = read_u64(&h[8..16]);
            if steps == 0 || rows == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "corrupt archive header",
                ));
            }
            let state = ArchiveState {
                steps,
                rows,
                cur_cdp: read_i64(&h[16..24]),
                last_row_cdp: read_i64(&h[24..32]),
                acc: [
                    CdpAcc {
                        value: read_f64(&h[32..40]),
                        known: read_u64(&h[40..48]),
                        unknown: read_u64(&h[48..56]),
                    },
                    CdpAcc {
                        value: read_f64(&h[56..64]),
                        known: read_u64(&h[64..72]),
                        unknown: read_u64(&h[72..80]),
                    },
                ],
                data_offset: offset,
            };
            offset += rows * 8 * DS_COUNT as u64;
            archives.push(state);
        }

        Ok(RrdFile {
            file,
            step,
            heartbeat,
            xff,
            consolidation,
            last_pdp,
            archives,
        })
    }

    /// Apply one sample. `latency` is NaN on loss; `loss` is 0.0 or 1.0.
    fn write(&mut self, ts_secs: i64, latency: f64, loss: f64) -> io::Result<()> {
        let step = self.step as i64;
        let pdp = ts_secs.div_euclid(step);

        // Advisory update: the archive has moved past this bucket
        if self.last_pdp >= 0 && pdp <= self.last_pdp {
            return Ok(());
        }

        // Samples skipped since the last update: unknown when the gap
        // exceeds the heartbeat, otherwise the gauge holds its new value
        let fill = if self.last_pdp >= 0 {
            let gap_secs = (pdp - self.last_pdp) as u64 * self.step;
            if gap_secs > self.heartbeat {
                [f64::NAN, f64::NAN]
            } else {
                [latency, loss]
            }
        } else {
            [f64::NAN, f64::NAN]
        };

        let prev = self.last_pdp;
        for k in 0..self.archives.len() {
            self.feed_archive(k, prev, pdp, [latency, loss], fill)?;
        }

        self.last_pdp = pdp;
        self.persist_header()
    }

    /// Route one sample (plus any skipped samples before it) into one
    /// archive's consolidation state, closing buckets as they complete.
    fn feed_archive(
        &mut self,
        k: usize,
        prev_pdp: i64,
        pdp: i64,
        values: [f64; DS_COUNT],
        fill: [f64; DS_COUNT],
    ) -> io::Result<()> {
        let cf = self.consolidation;
        let steps = self.archives[k].steps as i64;
        let rows = self.archives[k].rows as i64;
        let cdp = pdp.div_euclid(steps);

        if self.archives[k].cur_cdp < 0 {
            // First write ever: sub-buckets before this sample were
            // never observed
            self.archives[k].cur_cdp = cdp;
            let missing = pdp.rem_euclid(steps) as u64;
            for ds in 0..DS_COUNT {
                self.archives[k].acc[ds].unknown += missing;
            }
        } else {
            let cur = self.archives[k].cur_cdp;

            // Skipped samples still belonging to the open bucket
            let cur_end = (cur + 1) * steps;
            let lo = prev_pdp + 1;
            let hi = pdp.min(cur_end);
            if hi > lo {
                let n = (hi - lo) as u64;
                for ds in 0..DS_COUNT {
                    accumulate(&mut self.archives[k].acc[ds], cf, fill[ds], n);
                }
            }

            if cdp > cur {
                self.close_cdp(k, cur)?;

                // Buckets strictly between consist purely of fill samples;
                // consolidating identical values yields the value itself
                let whole_lo = cur + 1;
                let whole_hi = cdp; // exclusive
                if whole_hi > whole_lo {
                    if whole_hi - whole_lo >= rows {
                        self.fill_all_rows(k, fill)?;
                    } else {
                        for b in whole_lo..whole_hi {
                            self.write_row(k, b, fill)?;
                        }
                    }
                    self.archives[k].last_row_cdp = whole_hi - 1;
                }

                // Open the new bucket; its samples before `pdp` are fill
                self.archives[k].cur_cdp = cdp;
                let lead = pdp - cdp * steps;
                if lead > 0 {
                    for ds in 0..DS_COUNT {
                        accumulate(&mut self.archives[k].acc[ds], cf, fill[ds], lead as u64);
                    }
                }
            }
        }

        // The sample itself
        for ds in 0..DS_COUNT {
            accumulate(&mut self.archives[k].acc[ds], cf, values[ds], 1);
        }

        // Close eagerly when this was the bucket's final sample, so a
        // just-completed bucket is visible to fetch before the next tick
        if pdp.rem_euclid(steps) == steps - 1 {
            let cur = self.archives[k].cur_cdp;
            self.close_cdp(k, cur)?;
            self.archives[k].cur_cdp = cur + 1;
        }

        Ok(())
    }

    /// Consolidate the open bucket and write its row. Samples never fed
    /// (archive opened mid-bucket) count as unknown.
    fn close_cdp(&mut self, k: usize, cdp: i64) -> io::Result<()> {
        let steps = self.archives[k].steps;
        let xff = self.xff;

        let mut row = [f64::NAN; DS_COUNT];
        for ds in 0..DS_COUNT {
            let acc = self.archives[k].acc[ds];
            let fed = acc.known + acc.unknown;
            let unknown = acc.unknown + steps.saturating_sub(fed);
            let unknown_frac = unknown as f64 / steps as f64;

            row[ds] = if acc.known == 0 || unknown_frac > xff {
                f64::NAN
            } else {
                match self.consolidation {
                    Aggregation::Average => acc.value / acc.known as f64,
                    Aggregation::Min | Aggregation::Max | Aggregation::Last => acc.value,
                }
            };
        }

        self.write_row(k, cdp, row)?;
        let archive = &mut self.archives[k];
        archive.last_row_cdp = archive.last_row_cdp.max(cdp);
        archive.acc = [CdpAcc::default(); DS_COUNT];
        Ok(())
    }

    fn row_offsets(&self, k: usize, cdp: i64) -> (u64, u64) {
        let archive = &self.archives[k];
        let slot = cdp.rem_euclid(archive.rows as i64) as u64;
        let latency = archive.data_offset + slot * 8;
        let loss = archive.data_offset + archive.rows * 8 + slot * 8;
        (latency, loss)
    }

    fn write_row(&mut self, k: usize, cdp: i64, row: [f64; DS_COUNT]) -> io::Result<()> {
        let (latency_off, loss_off) = self.row_offsets(k, cdp);
        self.file.write_all_at(&row[DS_LATENCY].to_le_bytes(), latency_off)?;
        self.file.write_all_at(&row[DS_LOSS].to_le_bytes(), loss_off)?;
        Ok(())
    }

    fn read_row(&self, k: usize, cdp: i64) -> io::Result<[f64; DS_COUNT]> {
        let (latency_off, loss_off) = self.row_offsets(k, cdp);
        let mut buf = [0u8; 8];
        self.file.read_exact_at(&mut buf, latency_off)?;
        let latency = f64::from_le_bytes(buf);
        self.file.read_exact_at(&mut buf, loss_off)?;
        let loss = f64::from_le_bytes(buf);
        Ok([latency, loss])
    }

    fn fill_all_rows(&mut self, k: usize, row: [f64; DS_COUNT]) -> io::Result<()> {
        let archive = &self.archives[k];
        let rows = archive.rows as usize;

        let mut buf = Vec::with_capacity(rows * 8);
        for _ in 0..rows {
            buf.extend_from_slice(&row[DS_LATENCY].to_le_bytes());
        }
        self.file.write_all_at(&buf, archive.data_offset)?;

        buf.clear();
        for _ in 0..rows {
            buf.extend_from_slice(&row[DS_LOSS].to_le_bytes());
        }
        self.file
            .write_all_at(&buf, archive.data_offset + archive.rows * 8)?;
        Ok(())
    }

    fn persist_header(&mut self) -> io::Result<()> {
        let mut buf = Vec::with_capacity(
            HEADER_LEN as usize + self.archives.len() * ARCHIVE_HEADER_LEN as usize,
        );
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.step.to_le_bytes());
        buf.extend_from_slice(&self.heartbeat.to_le_bytes());
        buf.extend_from_slice(&self.xff.to_le_bytes());
        buf.push(match self.consolidation {
            Aggregation::Average => 0,
            Aggregation::Min => 1,
            Aggregation::Max => 2,
            Aggregation::Last => 3,
        });
        buf.extend_from_slice(&[0u8; 3]);
        buf.extend_from_slice(&(self.archives.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.last_pdp.to_le_bytes());

        for archive in &self.archives {
            buf.extend_from_slice(&archive.steps.to_le_bytes());
            buf.extend_from_slice(&archive.rows.to_le_bytes());
            buf.extend_from_slice(&archive.cur_cdp.to_le_bytes());
            buf.extend_from_slice(&archive.last_row_cdp.to_le_bytes());
            for acc in &archive.acc {
                buf.extend_from_slice(&acc.value.to_le_bytes());
                buf.extend_from_slice(&acc.known.to_le_bytes());
                buf.extend_from_slice(&acc.unknown.to_le_bytes());
            }
        }

        self.file.write_all_at(&buf, 0)
    }

    /// Read consolidated points for `[from, to]` from the archive that
    /// best matches the span.
    fn fetch(&self, from_secs: i64, to_secs: i64) -> io::Result<Vec<DataPoint>> {
        if to_secs < from_secs {
            return Ok(Vec::new());
        }

        let desired = desired_step_secs(self.step, (to_secs - from_secs) as u64);
        let k = self.choose_archive(desired);
        let archive = &self.archives[k];
        let bucket_secs = archive.bucket_secs(self.step);

        let first = from_secs.div_euclid(bucket_secs);
        let last = to_secs.div_euclid(bucket_secs);

        let mut points = Vec::with_capacity((last - first + 1) as usize);
        for cdp in first..=last {
            let row = if archive.retains(cdp) {
                self.read_row(k, cdp)?
            } else {
                [f64::NAN, f64::NAN]
            };
            let ts = Utc
                .timestamp_opt(cdp * bucket_secs, 0)
                .single()
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            points.push(DataPoint {
                timestamp: ts,
                value: row[DS_LATENCY],
                loss: row[DS_LOSS],
            });
        }

        Ok(points)
    }

    /// Pick the archive with the smallest bucket at least as coarse as
    /// the desired step, falling back to the coarsest available.
    fn choose_archive(&self, desired_secs: u64) -> usize {
        let mut best: Option<(usize, u64)> = None;
        let mut coarsest = (0usize, 0u64);

        for (k, archive) in self.archives.iter().enumerate() {
            let bucket = archive.steps * self.step;
            if bucket >= coarsest.1 {
                coarsest = (k, bucket);
            }
            if bucket >= desired_secs {
                match best {
                    Some((_, b)) if b <= bucket => {}
                    _ => best = Some((k, bucket)),
                }
            }
        }

        best.map(|(k, _)| k).unwrap_or(coarsest.0)
    }
}

/// The query step matching a span: base step up to a day, one minute up
/// to a week, one hour beyond.
fn desired_step_secs(base_step: u64, span_secs: u64) -> u64 {
    const DAY: u64 = 24 * 3600;
    if span_secs <= DAY {
        base_step
    } else if span_secs <= 7 * DAY {
        60
    } else {
        3600
    }
}

/// Fold one or more identical samples into a consolidation accumulator.
fn accumulate(acc: &mut CdpAcc, cf: Aggregation, value: f64, n: u64) {
    if n == 0 {
        return;
    }
    if value.is_nan() {
        acc.unknown += n;
        return;
    }

    if acc.known == 0 {
        acc.value = match cf {
            Aggregation::Average => value * n as f64,
            Aggregation::Min | Aggregation::Max | Aggregation::Last => value,
        };
    } else {
        match cf {
            Aggregation::Average => acc.value += value * n as f64,
            Aggregation::Min => acc.value = acc.value.min(value),
            Aggregation::Max => acc.value = acc.value.max(value),
            Aggregation::Last => acc.value = value,
        }
    }
    acc.known += n;
}

fn read_u32(buf: &[u8]) -> u32 {
    u32::from_le_bytes(buf[0..4].try_into().unwrap())
}

fn read_u64(buf: &[u8]) -> u64 {
    u64::from_le_bytes(buf[0..8].try_into().unwrap())
}

fn read_i64(buf: &[u8]) -> i64 {
    i64::from_le_bytes(buf[0..8].try_into().unwrap())
}

fn read_f64(buf: &[u8]) -> f64 {
    f64::from_le_bytes(buf[0..8].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_target_name() {
        assert_eq!(sanitize_target_name("Google DNS"), "google_dns");
        assert_eq!(sanitize_target_name("Server/Main"), "server_main");
        assert_eq!(sanitize_target_name("Server\\Main"), "server_main");
        assert_eq!(sanitize_target_name("Test<>:\"?*|"), "test");
        assert_eq!(sanitize_target_name("???"), "unnamed");
        assert_eq!(sanitize_target_name(""), "unnamed");
        assert_eq!(sanitize_target_name("__a__b__"), "a_b");
        assert_eq!(sanitize_target_name("web-01.example.com"), "web_01_example_com");
    }

    #[test]
    fn test_sanitize_is_idempotent_and_bounded() {
        let inputs = [
            "Google DNS",
            "Test<>:\"?*|",
            "???",
            "web-01.example.com",
            "Ünïcode Nàme",
            &"x".repeat(300),
            &"- ".repeat(150),
        ];
        for input in inputs {
            let once = sanitize_target_name(input);
            let twice = sanitize_target_name(&once);
            assert_eq!(once, twice, "not idempotent for {:?}", input);
            assert!(once.len() <= 200, "too long for {:?}", input);
            assert!(
                once.chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'),
                "bad characters in {:?} -> {:?}",
                input,
                once
            );
        }
    }

    #[test]
    fn test_sanitized_filename_length() {
        let long = "A".repeat(300);
        let stem = sanitize_target_name(&long);
        assert_eq!(stem.len(), 200);
        // stem + ".rrd" stays within the 204-byte bound
        assert!(format!("{}.rrd", stem).len() <= 204);
    }

    #[test]
    fn test_desired_step() {
        const DAY: u64 = 86_400;
        assert_eq!(desired_step_secs(10, 3_600), 10);
        assert_eq!(desired_step_secs(10, DAY), 10);
        assert_eq!(desired_step_secs(10, DAY + 1), 60);
        assert_eq!(desired_step_secs(10, 3 * DAY), 60);
        assert_eq!(desired_step_secs(10, 7 * DAY), 60);
        assert_eq!(desired_step_secs(10, 8 * DAY), 3_600);
        assert_eq!(desired_step_secs(10, 90 * DAY), 3_600);
    }

    #[test]
    fn test_accumulate_average() {
        let mut acc = CdpAcc::default();
        accumulate(&mut acc, Aggregation::Average, 10.0, 1);
        accumulate(&mut acc, Aggregation::Average, 20.0, 2);
        accumulate(&mut acc, Aggregation::Average, f64::NAN, 3);

        assert_eq!(acc.known, 3);
        assert_eq!(acc.unknown, 3);
        assert_eq!(acc.value, 50.0);
    }

    #[test]
    fn test_accumulate_min_max_last() {
        let mut min = CdpAcc::default();
        let mut max = CdpAcc::default();
        let mut last = CdpAcc::default();
        for v in [20.0, 5.0, 30.0] {
            accumulate(&mut min, Aggregation::Min, v, 1);
            accumulate(&mut max, Aggregation::Max, v, 1);
            accumulate(&mut last, Aggregation::Last, v, 1);
        }

        assert_eq!(min.value, 5.0);
        assert_eq!(max.value, 30.0);
        assert_eq!(last.value, 30.0);
    }
}
