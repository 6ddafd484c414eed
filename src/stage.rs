//! Copies a trained checkpoint and its tokenizer files into the deployment
//! tree. Missing sources are warned about and skipped, never fatal.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::{CHECKPOINT_FILE, DEFAULT_MODEL_DIR, META_FILE, SP_MODEL_EXT};

pub const SOURCE_TREE: &str = "nanoGPT";
pub const DEPLOY_TREE: &str = "piGPT";
pub const DEFAULT_RUN: &str = "out-parannoul-bpe";
pub const DEFAULT_DATASET: &str = "parannoul";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyPair {
    pub src: PathBuf,
    pub dst: PathBuf,
}

#[derive(Debug, Clone)]
pub struct StagePlan {
    pub src_run_dir: PathBuf,
    pub src_data_dir: PathBuf,
    pub dst_model_dir: PathBuf,
}

impl StagePlan {
    pub fn for_project(root: &Path, run: &str, dataset: &str) -> Self {
        let src = root.join(SOURCE_TREE);
        Self {
            src_run_dir: src.join(run),
            src_data_dir: src.join("data").join(dataset),
            dst_model_dir: root.join(DEPLOY_TREE).join(DEFAULT_MODEL_DIR),
        }
    }

    /// Checkpoint first, then every `*.model` of the dataset, then the
    /// dataset `meta.pkl` so it wins over any earlier copy.
    pub fn pairs(&self) -> Result<Vec<CopyPair>> {
        let mut pairs = vec![CopyPair {
            src: self.src_run_dir.join(CHECKPOINT_FILE),
            dst: self.dst_model_dir.join(CHECKPOINT_FILE),
        }];
        if !self.src_data_dir.is_dir() {
            return Ok(pairs);
        }
        let mut models = vec![];
        let entries = std::fs::read_dir(&self.src_data_dir)
            .with_context(|| format!("read_dir {:?}", self.src_data_dir))?;
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) == Some(SP_MODEL_EXT) {
                models.push(path);
            }
        }
        models.sort();
        for src in models {
            let Some(name) = src.file_name() else {
                continue;
            };
            let dst = self.dst_model_dir.join(name);
            pairs.push(CopyPair { src, dst });
        }
        pairs.push(CopyPair {
            src: self.src_data_dir.join(META_FILE),
            dst: self.dst_model_dir.join(META_FILE),
        });
        Ok(pairs)
    }
}

#[derive(Debug, Default)]
pub struct StageReport {
    pub copied: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
}

/// Returns `Ok(false)` when `src` does not exist.
pub fn copy_file(src: &Path, dst: &Path) -> Result<bool> {
    if !src.exists() {
        warn!("source not found: {src:?}");
        return Ok(false);
    }
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create {parent:?}"))?;
    }
    std::fs::copy(src, dst).with_context(|| format!("copy {src:?} -> {dst:?}"))?;
    info!("copied {src:?} -> {dst:?}");
    Ok(true)
}

pub fn run(plan: &StagePlan) -> Result<StageReport> {
    let mut report = StageReport::default();
    if !plan.src_data_dir.is_dir() {
        warn!("source data dir not found: {:?}", plan.src_data_dir);
        report.skipped.push(plan.src_data_dir.clone());
    }
    for pair in plan.pairs()? {
        if copy_file(&pair.src, &pair.dst)? {
            report.copied.push(pair.dst);
        } else {
            report.skipped.push(pair.src);
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn copy_is_byte_identical_and_creates_parents() -> Result<()> {
        let dir = tempdir()?;
        let src = dir.path().join("ckpt.pt");
        let payload: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        std::fs::write(&src, &payload)?;
        let dst = dir.path().join("a/b/c/ckpt.pt");
        assert!(copy_file(&src, &dst)?);
        assert_eq!(std::fs::read(&dst)?, payload);
        Ok(())
    }

    #[test]
    fn copy_overwrites_existing_destination() -> Result<()> {
        let dir = tempdir()?;
        let src = dir.path().join("new");
        let dst = dir.path().join("old");
        std::fs::write(&src, b"new")?;
        std::fs::write(&dst, b"old contents")?;
        copy_file(&src, &dst)?;
        assert_eq!(std::fs::read(&dst)?, b"new");
        Ok(())
    }

    #[test]
    fn missing_source_leaves_destination_untouched() -> Result<()> {
        let dir = tempdir()?;
        let dst = dir.path().join("keep.pkl");
        std::fs::write(&dst, b"existing")?;
        assert!(!copy_file(&dir.path().join("absent"), &dst)?);
        assert_eq!(std::fs::read(&dst)?, b"existing");

        let fresh = dir.path().join("never/created");
        assert!(!copy_file(&dir.path().join("absent"), &fresh)?);
        assert!(!fresh.exists());
        assert!(!dir.path().join("never").exists());
        Ok(())
    }

    #[test]
    fn plan_orders_checkpoint_models_then_meta() -> Result<()> {
        let root = tempdir()?;
        let plan = StagePlan::for_project(root.path(), DEFAULT_RUN, DEFAULT_DATASET);
        std::fs::create_dir_all(&plan.src_data_dir)?;
        std::fs::write(plan.src_data_dir.join("b.model"), b"b")?;
        std::fs::write(plan.src_data_dir.join("a.model"), b"a")?;
        std::fs::write(plan.src_data_dir.join("train.bin"), b"x")?;

        let names: Vec<String> = plan
            .pairs()?
            .iter()
            .map(|p| p.dst.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["ckpt.pt", "a.model", "b.model", "meta.pkl"]);
        Ok(())
    }

    #[test]
    fn stages_full_layout() -> Result<()> {
        let root = tempdir()?;
        let plan = StagePlan::for_project(root.path(), DEFAULT_RUN, DEFAULT_DATASET);
        std::fs::create_dir_all(&plan.src_run_dir)?;
        std::fs::create_dir_all(&plan.src_data_dir)?;
        std::fs::write(plan.src_run_dir.join("ckpt.pt"), b"weights")?;
        std::fs::write(plan.src_data_dir.join("parannoul.model"), b"spm")?;
        std::fs::write(plan.src_data_dir.join("meta.pkl"), b"meta")?;

        let report = run(&plan)?;
        assert_eq!(report.copied.len(), 3);
        assert!(report.skipped.is_empty());
        let models = root.path().join("piGPT/models");
        assert_eq!(std::fs::read(models.join("ckpt.pt"))?, b"weights");
        assert_eq!(std::fs::read(models.join("parannoul.model"))?, b"spm");
        assert_eq!(std::fs::read(models.join("meta.pkl"))?, b"meta");
        Ok(())
    }

    #[test]
    fn missing_sources_are_reported_not_fatal() -> Result<()> {
        let root = tempdir()?;
        let plan = StagePlan::for_project(root.path(), DEFAULT_RUN, DEFAULT_DATASET);
        let report = run(&plan)?;
        assert!(report.copied.is_empty());
        assert_eq!(
            report.skipped,
            vec![plan.src_data_dir.clone(), plan.src_run_dir.join("ckpt.pt")]
        );
        assert!(!plan.dst_model_dir.exists());
        Ok(())
    }
}
