//! "Which photos contain this person": resolve a loosely typed name to a
//! known identity and copy every photo of them into an output folder.

use anyhow::Result;
use futures_util::future::join_all;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::db;
use crate::models::image::UNKNOWN_IDENTITY;
use crate::remote::{join_remote, ContentStore};

// Added when the query's characters appear in order inside the candidate
const SUBSEQUENCE_BONUS: f64 = 0.1;
const HASH_TAG_LEN: usize = 8;

fn normalize(s: &str) -> Vec<char> {
    s.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

fn lcs_len(a: &[char], b: &[char]) -> usize {
    let mut prev = vec![0usize; b.len() + 1];
    let mut cur = vec![0usize; b.len() + 1];
    for ca in a {
        for (j, cb) in b.iter().enumerate() {
            cur[j + 1] = if ca == cb { prev[j] + 1 } else { prev[j + 1].max(cur[j]) };
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

/// Similarity in [0, 1 + bonus]: indel ratio `2·LCS / (|a| + |b|)` on the
/// normalized strings.
pub fn name_similarity(query: &str, candidate: &str) -> f64 {
    let (q, c) = (normalize(query), normalize(candidate));
    if q.is_empty() || c.is_empty() {
        return 0.0;
    }
    let lcs = lcs_len(&q, &c);
    let ratio = 2.0 * lcs as f64 / (q.len() + c.len()) as f64;
    if lcs == q.len() { ratio + SUBSEQUENCE_BONUS } else { ratio }
}

/// Best-scoring candidate; the earliest wins ties. `None` when there are no
/// candidates or nothing shares a character with the query.
pub fn resolve_identity<'a>(query: &str, candidates: &'a [String]) -> Option<&'a str> {
    let mut best: Option<(&str, f64)> = None;
    for c in candidates {
        let score = name_similarity(query, c);
        if score > 0.0 && best.map_or(true, |(_, s)| score > s) {
            best = Some((c.as_str(), score));
        }
    }
    best.map(|(c, _)| c)
}

#[derive(Clone, Debug, Serialize)]
pub struct CopyTask {
    pub hash: String,
    pub source: String,
    pub dest: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct ExportPlan {
    pub identity: String,
    pub folder: String,
    pub copies: Vec<CopyTask>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ExportReport {
    pub copied: usize,
    pub failed: usize,
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// `IMG_0001.jpg` from two folders would land on the same destination;
/// tag each with the start of its content hash instead.
fn disambiguate(name: &str, hash: &str) -> String {
    let tag = hash.get(..HASH_TAG_LEN).unwrap_or(hash);
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}-{}.{}", stem, tag, ext),
        _ => format!("{}-{}", name, tag),
    }
}

/// Resolve `query` against the named identities in the index and list the
/// copies needed to gather that identity's photos under
/// `<output_dir>/<identity>/`. File names shared by several photos get a
/// hash tag so no copy overwrites another. Photos with no catalog path are
/// left out.
pub fn plan_export(conn: &Connection, query: &str, location: &str, output_dir: &str) -> Result<Option<ExportPlan>> {
    let names: Vec<String> = db::query::identity_names(conn)?
        .into_iter()
        .filter(|n| n != UNKNOWN_IDENTITY)
        .collect();
    let Some(identity) = resolve_identity(query, &names) else {
        return Ok(None);
    };
    let folder = join_remote(output_dir, identity);
    let mut found = Vec::new();
    for hash in db::query::images_for_identity(conn, identity)? {
        match db::query::catalog_path(conn, &hash)? {
            Some(path) => found.push((hash, path)),
            None => warn!("No catalog path for {} ({}), not exported", hash, identity),
        }
    }

    let mut name_counts: HashMap<&str, usize> = HashMap::new();
    for (_, path) in &found {
        *name_counts.entry(file_name(path)).or_default() += 1;
    }
    let copies = found
        .iter()
        .map(|(hash, path)| {
            let name = file_name(path);
            let dest_name = if name_counts[name] > 1 { disambiguate(name, hash) } else { name.to_string() };
            CopyTask {
                hash: hash.clone(),
                source: join_remote(location, path),
                dest: join_remote(&folder, &dest_name),
            }
        })
        .collect();
    Ok(Some(ExportPlan { identity: identity.to_string(), folder, copies }))
}

/// Create the destination folder and launch every copy at once. A failed
/// copy is logged and does not cancel the others.
pub async fn run_export(content: &dyn ContentStore, plan: &ExportPlan) -> Result<ExportReport> {
    content.mkdir(&plan.folder).await?;
    let results = join_all(plan.copies.iter().map(|task| async move {
        let r = content.copy(&task.source, &task.dest).await;
        if let Err(e) = &r {
            warn!("Copy {} -> {} failed: {:#}", task.source, task.dest, e);
        }
        r.is_ok()
    }))
    .await;
    let copied = results.iter().filter(|ok| **ok).count();
    let report = ExportReport { copied, failed: results.len() - copied };
    info!("Exported {} photos of {} ({} failed)", report.copied, plan.identity, report.failed);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_resolves_abbreviated_name() {
        let known = names(&["Unknown", "JaneSmith", "CorbinVia", "CarlVinson"]);
        assert_eq!(resolve_identity("crbn vai", &known), Some("CorbinVia"));
        assert_eq!(resolve_identity("Jane Smith", &known), Some("JaneSmith"));
    }

    #[test]
    fn test_indel_ratio() {
        // "crbnvai" vs "corbinvia": LCS "crbnvi" = 6, 2*6/16
        assert!((name_similarity("crbn vai", "CorbinVia") - 0.75).abs() < 1e-9);
        assert!((name_similarity("JaneSmith", "janesmith") - (1.0 + SUBSEQUENCE_BONUS)).abs() < 1e-9);
    }

    #[test]
    fn test_no_candidates() {
        assert_eq!(resolve_identity("anyone", &[]), None);
        assert_eq!(resolve_identity("!!!", &names(&["Alice"])), None);
        assert_eq!(resolve_identity("zzz", &names(&["Alice"])), None);
    }

    #[test]
    fn test_disambiguate_keeps_extension() {
        assert_eq!(disambiguate("IMG_0001.jpg", "0123456789abcdef"), "IMG_0001-01234567.jpg");
        assert_eq!(disambiguate("IMG_0001.jpg", "h1"), "IMG_0001-h1.jpg");
        assert_eq!(disambiguate("README", "abcdef0123"), "README-abcdef01");
        assert_eq!(disambiguate(".hidden", "abcdef0123"), ".hidden-abcdef01");
    }

    #[test]
    fn test_ties_go_to_first() {
        assert_eq!(resolve_identity("ab", &names(&["AbX", "AbY"])), Some("AbX"));
    }
}
