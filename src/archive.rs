//! Opportunistic archive maintenance: gzip-compress finished daily CSV
//! spools, then roll days up into monthly archives and months into yearly
//! ones. Every stage writes to a temporary file, re-opens and checks the
//! result, and only then renames it into place and deletes its inputs; a
//! crash at any point leaves the sources intact.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::clock;
use crate::Result;

#[derive(Debug)]
pub struct Consolidator {
    root: PathBuf,
}

impl Consolidator {
    pub fn new(root: impl Into<PathBuf>) -> Consolidator {
        Consolidator { root: root.into() }
    }

    fn daily_dir(&self) -> PathBuf {
        self.root.join("energy").join("daily")
    }

    fn monthly_dir(&self) -> PathBuf {
        self.root.join("energy").join("monthly")
    }

    fn yearly_dir(&self) -> PathBuf {
        self.root.join("energy").join("yearly")
    }

    /// One full maintenance pass, run after the hourly spool. Idempotent:
    /// with no new inputs it changes nothing.
    pub fn run(&self, wall_ms: u64) -> Result<()> {
        let today = clock::date_string(wall_ms);
        let (month, year) = (today[..7].to_string(), today[..4].to_string());
        self.compress_finished_dailies(&today)?;
        self.rollup(&self.daily_dir(), &self.monthly_dir(), 7, &month)?;
        self.rollup(&self.monthly_dir(), &self.yearly_dir(), 4, &year)?;
        Ok(())
    }

    /// Compress every `YYYY-MM-DD.csv` except today's, which is still
    /// being appended to.
    fn compress_finished_dailies(&self, today: &str) -> Result<()> {
        for path in list_with_suffix(&self.daily_dir(), ".csv")? {
            let Some(stem) = file_stem(&path, ".csv") else { continue };
            if stem == today || !is_date_stem(&stem) {
                continue;
            }
            if let Err(error) = self.compress_one(&path, &stem) {
                log::warn!("failed to compress {}: {}", path.display(), error);
            }
        }
        Ok(())
    }

    fn compress_one(&self, source: &Path, stem: &str) -> Result<()> {
        let final_gz = self.daily_dir().join(format!("{}.csv.gz", stem));
        let tmp_gz = self.daily_dir().join(format!("{}.csv.gz.tmp", stem));
        gzip_file(source, &tmp_gz)?;
        if !archive_has_content(&tmp_gz)? {
            log::warn!("compressed {} came out empty, keeping source", source.display());
            fs::remove_file(&tmp_gz)?;
            return Ok(());
        }
        fs::rename(&tmp_gz, &final_gz)?;
        fs::remove_file(source)?;
        log::debug!("compressed {}", final_gz.display());
        Ok(())
    }

    /// Concatenate groups of `.csv.gz` files from `src_dir` into one
    /// archive per group in `dst_dir`, keeping the CSV header once. The
    /// group is the first `group_len` characters of the file stem
    /// (`YYYY-MM` for days, `YYYY` for months); `current` is never rolled
    /// up because it is still growing.
    fn rollup(
        &self,
        src_dir: &Path,
        dst_dir: &Path,
        group_len: usize,
        current: &str,
    ) -> Result<()> {
        let mut groups: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
        for path in list_with_suffix(src_dir, ".csv.gz")? {
            let Some(stem) = file_stem(&path, ".csv.gz") else { continue };
            // Only well-formed date stems one level below the group size
            // participate; anything else is not ours to touch.
            if !is_date_stem(&stem) || stem.len() <= group_len {
                continue;
            }
            let group = stem[..group_len].to_string();
            if group != current {
                groups.entry(group).or_default().push(path);
            }
        }
        for (group, mut sources) in groups {
            sources.sort();
            if let Err(error) = self.rollup_group(dst_dir, &group, &sources) {
                log::warn!("rollup of {} failed, sources kept: {}", group, error);
                let _ = fs::remove_file(dst_dir.join(format!("{}.csv.tmp", group)));
                let _ = fs::remove_file(dst_dir.join(format!("{}.csv.gz.tmp", group)));
            }
        }
        Ok(())
    }

    fn rollup_group(&self, dst_dir: &Path, group: &str, sources: &[PathBuf]) -> Result<()> {
        fs::create_dir_all(dst_dir)?;
        let final_gz = dst_dir.join(format!("{}.csv.gz", group));
        let tmp_plain = dst_dir.join(format!("{}.csv.tmp", group));
        let tmp_gz = dst_dir.join(format!("{}.csv.gz.tmp", group));

        {
            let mut out = fs::File::create(&tmp_plain)?;
            let mut have_header = false;
            if final_gz.exists() {
                // Previous rollup of the same period: keep it, new days
                // append after it.
                append_decompressed(&final_gz, &mut out, false)?;
                have_header = true;
            }
            for source in sources {
                append_decompressed(source, &mut out, have_header)?;
                have_header = true;
            }
            out.sync_all()?;
        }

        gzip_file(&tmp_plain, &tmp_gz)?;
        if !archive_has_content(&tmp_gz)? {
            fs::remove_file(&tmp_gz)?;
            fs::remove_file(&tmp_plain)?;
            log::warn!("rollup of {} came out empty, keeping sources", group);
            return Ok(());
        }
        fs::rename(&tmp_gz, &final_gz)?;
        fs::remove_file(&tmp_plain)?;
        for source in sources {
            fs::remove_file(source)?;
        }
        log::info!("rolled {} files into {}", sources.len(), final_gz.display());
        Ok(())
    }
}

fn list_with_suffix(dir: &Path, suffix: &str) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    match fs::read_dir(dir) {
        Ok(entries) => {
            for entry in entries {
                let path = entry?.path();
                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                if name.ends_with(suffix) {
                    paths.push(path);
                }
            }
        }
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => return Err(error.into()),
    }
    paths.sort();
    Ok(paths)
}

fn file_stem(path: &Path, suffix: &str) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    Some(name.strip_suffix(suffix)?.to_string())
}

/// `YYYY-MM-DD`, `YYYY-MM` or `YYYY`.
fn is_date_stem(stem: &str) -> bool {
    match stem.len() {
        10 => NaiveDate::parse_from_str(stem, "%Y-%m-%d").is_ok(),
        7 => NaiveDate::parse_from_str(&format!("{}-01", stem), "%Y-%m-%d").is_ok(),
        4 => stem.chars().all(|c| c.is_ascii_digit()),
        _ => false,
    }
}

fn gzip_file(source: &Path, destination: &Path) -> Result<()> {
    let mut input = fs::File::open(source)?;
    let mut encoder = GzEncoder::new(fs::File::create(destination)?, Compression::default());
    io::copy(&mut input, &mut encoder)?;
    encoder.finish()?.sync_all()?;
    Ok(())
}

/// Re-open a fresh archive and make sure it decompresses to something.
fn archive_has_content(path: &Path) -> Result<bool> {
    let mut decoder = GzDecoder::new(fs::File::open(path)?);
    let decompressed = io::copy(&mut decoder, &mut io::sink())?;
    Ok(decompressed > 0)
}

/// Append the decompressed lines of `source`, optionally dropping its
/// header line. Lines are rewritten with a terminator, which also repairs
/// a torn final line from a crashed writer.
fn append_decompressed(source: &Path, out: &mut fs::File, skip_header: bool) -> Result<()> {
    let reader = BufReader::new(GzDecoder::new(fs::File::open(source)?));
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if index == 0 && skip_header {
            continue;
        }
        writeln!(out, "{}", line)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::BTreeMap;

    const HEADER: &str =
        "timestamp,channel,label,phase,active_imp,active_exp,reactive_imp,reactive_exp,apparent";

    // 2026-08-01 12:00:00 UTC
    const WALL: u64 = 1_785_585_600_000;

    fn write_daily(root: &Path, date: &str, rows: &[&str]) {
        let dir = root.join("energy").join("daily");
        fs::create_dir_all(&dir).unwrap();
        let mut content = format!("{}\n", HEADER);
        for row in rows {
            content.push_str(row);
            content.push('\n');
        }
        fs::write(dir.join(format!("{}.csv", date)), content).unwrap();
    }

    fn decompress(path: &Path) -> String {
        let mut decoder = GzDecoder::new(fs::File::open(path).unwrap());
        let mut content = String::new();
        io::Read::read_to_string(&mut decoder, &mut content).unwrap();
        content
    }

    fn tree_state(root: &Path) -> BTreeMap<String, Vec<u8>> {
        fn walk(dir: &Path, prefix: &str, state: &mut BTreeMap<String, Vec<u8>>) {
            let Ok(entries) = fs::read_dir(dir) else { return };
            for entry in entries {
                let entry = entry.unwrap();
                let name = format!("{}/{}", prefix, entry.file_name().to_string_lossy());
                if entry.path().is_dir() {
                    walk(&entry.path(), &name, state);
                } else {
                    state.insert(name, fs::read(entry.path()).unwrap());
                }
            }
        }
        let mut state = BTreeMap::new();
        walk(root, "", &mut state);
        state
    }

    #[test]
    fn test_compresses_finished_days_only() {
        let dir = tempfile::tempdir().unwrap();
        write_daily(dir.path(), "2026-07-31", &["a,1"]);
        write_daily(dir.path(), "2026-08-01", &["b,2"]);
        let consolidator = Consolidator::new(dir.path());
        consolidator.run(WALL).unwrap();

        let daily = dir.path().join("energy").join("daily");
        assert!(!daily.join("2026-07-31.csv").exists());
        // Today's spool is still being written to.
        assert!(daily.join("2026-08-01.csv").exists());
        assert!(!daily.join("2026-08-01.csv.gz").exists());
        // July is a finished month, so in the same pass the compressed day
        // rolled straight up into the monthly archive.
        assert!(!daily.join("2026-07-31.csv.gz").exists());
        let monthly = dir.path().join("energy").join("monthly").join("2026-07.csv.gz");
        assert!(decompress(&monthly).contains("a,1"));
    }

    #[test]
    fn test_monthly_rollup_keeps_header_once() {
        let dir = tempfile::tempdir().unwrap();
        write_daily(dir.path(), "2026-07-30", &["x,30"]);
        write_daily(dir.path(), "2026-07-31", &["y,31"]);
        let consolidator = Consolidator::new(dir.path());
        consolidator.run(WALL).unwrap();

        let monthly = dir.path().join("energy").join("monthly").join("2026-07.csv.gz");
        let content = decompress(&monthly);
        assert_eq!(content.matches(HEADER).count(), 1);
        assert!(content.starts_with(HEADER));
        assert!(content.contains("x,30"));
        assert!(content.contains("y,31"));
        let daily = dir.path().join("energy").join("daily");
        assert_eq!(list_with_suffix(&daily, ".csv.gz").unwrap().len(), 0);
    }

    #[test]
    fn test_existing_monthly_archive_is_extended() {
        let dir = tempfile::tempdir().unwrap();
        write_daily(dir.path(), "2026-07-30", &["x,30"]);
        let consolidator = Consolidator::new(dir.path());
        consolidator.run(WALL).unwrap();
        write_daily(dir.path(), "2026-07-31", &["y,31"]);
        consolidator.run(WALL).unwrap();

        let monthly = dir.path().join("energy").join("monthly").join("2026-07.csv.gz");
        let content = decompress(&monthly);
        assert_eq!(content.matches(HEADER).count(), 1);
        let x = content.find("x,30").unwrap();
        let y = content.find("y,31").unwrap();
        assert!(x < y);
    }

    #[test]
    fn test_yearly_rollup() {
        let dir = tempfile::tempdir().unwrap();
        write_daily(dir.path(), "2025-12-30", &["old,1"]);
        write_daily(dir.path(), "2025-12-31", &["old,2"]);
        let consolidator = Consolidator::new(dir.path());
        consolidator.run(WALL).unwrap();

        // December 2025 went daily -> monthly; 2025 is a finished year so
        // the month continued into the yearly archive.
        let yearly = dir.path().join("energy").join("yearly").join("2025.csv.gz");
        let content = decompress(&yearly);
        assert!(content.contains("old,1") && content.contains("old,2"));
        assert_eq!(content.matches(HEADER).count(), 1);
        assert!(!dir.path().join("energy").join("monthly").join("2025-12.csv.gz").exists());
    }

    #[test]
    fn test_second_run_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        write_daily(dir.path(), "2026-07-30", &["x,30"]);
        write_daily(dir.path(), "2025-06-01", &["z,1"]);
        let consolidator = Consolidator::new(dir.path());
        consolidator.run(WALL).unwrap();
        let before = tree_state(dir.path());
        consolidator.run(WALL).unwrap();
        assert_eq!(tree_state(dir.path()), before);
    }

    #[test]
    fn test_corrupt_source_keeps_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let daily = dir.path().join("energy").join("daily");
        fs::create_dir_all(&daily).unwrap();
        fs::write(daily.join("2026-07-30.csv.gz"), b"this is not gzip").unwrap();
        let consolidator = Consolidator::new(dir.path());
        consolidator.run(WALL).unwrap();

        assert!(daily.join("2026-07-30.csv.gz").exists());
        assert!(!dir.path().join("energy").join("monthly").join("2026-07.csv.gz").exists());
    }

    #[test]
    fn test_stale_tmp_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        write_daily(dir.path(), "2026-07-30", &["x,30"]);
        let daily = dir.path().join("energy").join("daily");
        fs::write(daily.join("2026-07-29.csv.gz.tmp"), b"leftover").unwrap();
        let consolidator = Consolidator::new(dir.path());
        consolidator.run(WALL).unwrap();

        let monthly = dir.path().join("energy").join("monthly").join("2026-07.csv.gz");
        let content = decompress(&monthly);
        assert!(content.contains("x,30"));
        assert!(!content.contains("leftover"));
    }

    #[test]
    fn test_unrelated_files_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let daily = dir.path().join("energy").join("daily");
        fs::create_dir_all(&daily).unwrap();
        fs::write(daily.join("notes.csv"), b"not a spool file").unwrap();
        let consolidator = Consolidator::new(dir.path());
        consolidator.run(WALL).unwrap();
        assert!(daily.join("notes.csv").exists());
    }
}
