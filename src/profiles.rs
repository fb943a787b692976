//! Profile enrollment from labeled reference photos.
//!
//! Reference files follow `<anything>_<Last>_<First>_<NN>.<ext>`, e.g.
//! `2019_via_corbin_01.jpg` enrolls "CorbinVia".

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::db::{self, DbPool};
use crate::matcher::{Profile, ProfileLibrary};
use crate::pipeline::encode::FaceEncoder;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LabelError {
    #[error("no '_' delimiter in {0}")]
    MissingDelimiter(String),
    #[error("last token of {0} is not a sequence number")]
    MissingSequence(String),
    #[error("{0} needs last and first name tokens before the sequence number")]
    MissingName(String),
    #[error("empty name token in {0}")]
    EmptyToken(String),
}

/// Uppercase every letter that follows a non-letter, lowercase the rest.
fn title_case(token: &str) -> String {
    let mut out = String::with_capacity(token.len());
    let mut prev_alpha = false;
    for c in token.chars() {
        if c.is_alphabetic() {
            if prev_alpha {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(c);
            prev_alpha = false;
        }
    }
    out
}

/// Display name from a reference file name: the two tokens before the
/// trailing sequence number are last and first name, joined as FirstLast.
pub fn parse_profile_label(file_name: &str) -> Result<String, LabelError> {
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name);
    if !stem.contains('_') {
        return Err(LabelError::MissingDelimiter(file_name.to_string()));
    }
    let tokens: Vec<&str> = stem.split('_').collect();
    let n = tokens.len();
    let seq = tokens[n - 1];
    if seq.is_empty() || !seq.chars().all(|c| c.is_ascii_digit()) {
        return Err(LabelError::MissingSequence(file_name.to_string()));
    }
    if n < 3 {
        return Err(LabelError::MissingName(file_name.to_string()));
    }
    let (last, first) = (tokens[n - 3].trim(), tokens[n - 2].trim());
    if last.is_empty() || first.is_empty() {
        return Err(LabelError::EmptyToken(file_name.to_string()));
    }
    Ok(format!("{}{}", title_case(first), title_case(last)))
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct EnrollmentReport {
    pub images: usize,
    pub enrolled: usize,
    pub profiles: usize,
    /// (file, reason) for every reference image that was not used
    pub rejected: Vec<(String, String)>,
}

fn is_image(path: &Path) -> bool {
    mime_guess::from_path(path)
        .first()
        .map(|m| m.type_() == mime_guess::mime::IMAGE)
        .unwrap_or(false)
}

/// Build a library from every labeled image under `folder`. Each reference
/// image must contain exactly one face. Profiles are ordered by the first
/// file (in name order) that enrolled them.
pub fn enroll_from_folder(encoder: &FaceEncoder, folder: &Path) -> Result<(ProfileLibrary, EnrollmentReport)> {
    if !folder.is_dir() {
        anyhow::bail!("enrollment folder {} is not a directory", folder.display());
    }
    let mut report = EnrollmentReport::default();
    let mut labeled: Vec<(PathBuf, String)> = Vec::new();
    for entry in WalkDir::new(folder).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() || !is_image(entry.path()) {
            continue;
        }
        report.images += 1;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        match parse_profile_label(&file_name) {
            Ok(name) => labeled.push((entry.into_path(), name)),
            Err(e) => {
                warn!("Rejecting reference {}: {}", file_name, e);
                report.rejected.push((file_name, e.to_string()));
            }
        }
    }

    let paths: Vec<PathBuf> = labeled.iter().map(|(p, _)| p.clone()).collect();
    let results = encoder.encode_files(&paths);

    let mut profiles: Vec<Profile> = Vec::new();
    let mut by_name: HashMap<String, usize> = HashMap::new();
    for ((path, name), result) in labeled.into_iter().zip(results) {
        let file_name = path.file_name().map(|f| f.to_string_lossy().into_owned()).unwrap_or_default();
        let reason = match result {
            Ok(mut faces) if faces.len() == 1 => {
                let idx = *by_name.entry(name.clone()).or_insert_with(|| {
                    profiles.push(Profile { name: name.clone(), references: Vec::new() });
                    profiles.len() - 1
                });
                profiles[idx].references.push(faces.remove(0).embedding);
                report.enrolled += 1;
                continue;
            }
            Ok(faces) => format!("expected exactly one face, found {}", faces.len()),
            Err(e) => format!("{:#}", e),
        };
        warn!("Rejecting reference {}: {}", file_name, reason);
        report.rejected.push((file_name, reason));
    }
    report.profiles = profiles.len();
    info!(
        "Enrollment: {} images, {} references enrolled into {} profiles, {} rejected",
        report.images, report.enrolled, report.profiles, report.rejected.len()
    );
    Ok((ProfileLibrary::new(profiles), report))
}

/// Enroll and persist. The stored library is only replaced when at least one
/// profile was enrolled.
pub async fn enroll_and_store(
    pool: &DbPool,
    encoder: FaceEncoder,
    folder: PathBuf,
) -> Result<(ProfileLibrary, EnrollmentReport)> {
    let (library, report) = tokio::task::spawn_blocking(move || enroll_from_folder(&encoder, &folder)).await??;
    if library.is_empty() {
        anyhow::bail!("no profiles enrolled ({} images rejected)", report.rejected.len());
    }
    let stored = library.profiles().to_vec();
    db::with_conn(pool, move |conn| db::writer::save_profiles(conn, &stored))
        .await
        .context("saving profile library")?;
    Ok((library, report))
}

pub async fn load_library(pool: &DbPool) -> Result<ProfileLibrary> {
    let profiles = db::with_conn(pool, db::query::load_profiles).await?;
    Ok(ProfileLibrary::new(profiles))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_standard_label() {
        assert_eq!(parse_profile_label("2019_via_corbin_01.jpg").unwrap(), "CorbinVia");
        assert_eq!(parse_profile_label("headshots_SMITH_jANE_12.JPG").unwrap(), "JaneSmith");
        assert_eq!(parse_profile_label("via_corbin_3.png").unwrap(), "CorbinVia");
    }

    #[test]
    fn test_parse_title_cases_like_names() {
        assert_eq!(parse_profile_label("x_o'brien_mary-jane_01.jpg").unwrap(), "Mary-JaneO'Brien");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            parse_profile_label("portrait.jpg"),
            Err(LabelError::MissingDelimiter("portrait.jpg".into()))
        );
        assert_eq!(
            parse_profile_label("via_corbin.jpg"),
            Err(LabelError::MissingSequence("via_corbin.jpg".into()))
        );
        assert_eq!(
            parse_profile_label("corbin_01.jpg"),
            Err(LabelError::MissingName("corbin_01.jpg".into()))
        );
        assert_eq!(
            parse_profile_label("x__corbin_01.jpg"),
            Err(LabelError::EmptyToken("x__corbin_01.jpg".into()))
        );
        assert_eq!(
            parse_profile_label("x_via_corbin_.jpg"),
            Err(LabelError::MissingSequence("x_via_corbin_.jpg".into()))
        );
    }
}
