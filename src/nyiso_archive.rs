use anyhow::{Context, Result};
use chrono::NaiveDate;
use rayon::prelude::*;
use regex::Regex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use zip::ZipArchive;

/// Raw NYISO day-ahead file covering every generator for one day.
pub fn raw_day_file_name(date: NaiveDate) -> String {
    format!("{}damlbmp_gen.csv", date.format("%Y%m%d"))
}

/// Monthly archive that bundles the raw day files of `date`'s month.
pub fn monthly_archive_name(date: NaiveDate) -> String {
    format!("{}01damlbmp_gen_csv.zip", date.format("%Y%m"))
}

/// Date encoded in a raw day file name such as `20231128damlbmp_gen.csv`.
pub fn raw_day_file_date(file_name: &str) -> Option<NaiveDate> {
    let re = Regex::new(r"^(\d{8})damlbmp_gen\.csv$").ok()?;
    let caps = re.captures(file_name)?;
    NaiveDate::parse_from_str(&caps[1], "%Y%m%d").ok()
}

fn is_monthly_archive(file_name: &str) -> bool {
    Regex::new(r"^\d{6}01damlbmp_gen_csv\.zip$")
        .map(|re| re.is_match(file_name))
        .unwrap_or(false)
}

/// Dates whose raw day file is not in `storage_dir` yet.
pub fn missing_raw_days(storage_dir: &Path, dates: &[NaiveDate]) -> Vec<NaiveDate> {
    dates
        .iter()
        .copied()
        .filter(|d| !storage_dir.join(raw_day_file_name(*d)).exists())
        .collect()
}

/// Unpacks monthly archives into the flat storage directory.
pub struct ArchiveExtractor {
    archive_dir: PathBuf,
    storage_dir: PathBuf,
    extracted_count: Arc<AtomicUsize>,
}

impl ArchiveExtractor {
    pub fn new(archive_dir: PathBuf, storage_dir: PathBuf) -> Self {
        Self {
            archive_dir,
            storage_dir,
            extracted_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn extracted_count(&self) -> usize {
        self.extracted_count.load(Ordering::SeqCst)
    }

    pub fn find_archives(&self) -> Vec<PathBuf> {
        let mut archives: Vec<PathBuf> = walkdir::WalkDir::new(&self.archive_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| {
                e.file_name()
                    .to_str()
                    .map(is_monthly_archive)
                    .unwrap_or(false)
            })
            .map(|e| e.into_path())
            .collect();
        archives.sort();
        archives
    }

    pub fn extract_all(&self) -> Result<usize> {
        fs::create_dir_all(&self.storage_dir)?;

        let archives = self.find_archives();
        println!("Found {} monthly archives in {}", archives.len(), self.archive_dir.display());

        archives.par_iter().for_each(|archive| {
            if let Err(e) = self.extract_archive(archive) {
                eprintln!("Error extracting {:?}: {}", archive, e);
            }
        });

        println!("Extracted {} day files to {}", self.extracted_count(), self.storage_dir.display());
        Ok(self.extracted_count())
    }

    fn extract_archive(&self, archive_path: &Path) -> Result<()> {
        let file = fs::File::open(archive_path)
            .with_context(|| format!("Failed to open archive: {:?}", archive_path))?;
        let mut archive = ZipArchive::new(file)
            .with_context(|| format!("Failed to read archive: {:?}", archive_path))?;

        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            let name = match Path::new(entry.name()).file_name().and_then(|s| s.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            if raw_day_file_date(&name).is_none() {
                continue;
            }

            let outpath = self.storage_dir.join(&name);
            if outpath.exists() {
                continue;
            }

            let mut outfile = fs::File::create(&outpath)?;
            io::copy(&mut entry, &mut outfile)?;
            self.extracted_count.fetch_add(1, Ordering::SeqCst);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_file_names_round_trip_dates() {
        let d = date(2023, 11, 28);
        assert_eq!(raw_day_file_name(d), "20231128damlbmp_gen.csv");
        assert_eq!(monthly_archive_name(d), "20231101damlbmp_gen_csv.zip");
        assert_eq!(raw_day_file_date("20231128damlbmp_gen.csv"), Some(d));
        assert_eq!(raw_day_file_date("20231128realtime_gen.csv"), None);
        assert!(is_monthly_archive("20231101damlbmp_gen_csv.zip"));
        assert!(!is_monthly_archive("20231101damlbmp_zone_csv.zip"));
    }

    #[test]
    fn test_extracts_day_files_from_monthly_archive() {
        let archive_dir = tempfile::tempdir().unwrap();
        let storage_dir = tempfile::tempdir().unwrap();

        let archive_path = archive_dir.path().join("20231101damlbmp_gen_csv.zip");
        let mut writer = zip::ZipWriter::new(fs::File::create(&archive_path).unwrap());
        for day in ["20231101", "20231102"] {
            writer
                .start_file(format!("{}damlbmp_gen.csv", day), FileOptions::default())
                .unwrap();
            writer.write_all(b"Time Stamp,Name,PTID\n").unwrap();
        }
        writer.start_file("readme.txt", FileOptions::default()).unwrap();
        writer.write_all(b"ignored").unwrap();
        writer.finish().unwrap();

        let extractor = ArchiveExtractor::new(
            archive_dir.path().to_path_buf(),
            storage_dir.path().to_path_buf(),
        );
        assert_eq!(extractor.find_archives().len(), 1);
        assert_eq!(extractor.extract_all().unwrap(), 2);

        let wanted = [date(2023, 11, 1), date(2023, 11, 2), date(2023, 11, 3)];
        assert_eq!(missing_raw_days(storage_dir.path(), &wanted), vec![date(2023, 11, 3)]);
        assert!(!storage_dir.path().join("readme.txt").exists());
    }
}
