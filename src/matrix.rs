//! Cartesian-product test driver over artifact sets.

use anyhow::Context;
use std::future::Future;
use tracing::info;

use crate::artifacts::{Artifact, ArtifactKind, ArtifactSet};
use crate::error::{Error, Result};

/// One combination of the matrix: one artifact from each set plus the
/// scenario parameters.
#[derive(Debug, Clone)]
pub struct MatrixCell<P> {
    index: usize,
    artifacts: Vec<Artifact>,
    params: P,
}

impl<P> MatrixCell<P> {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Selected artifacts, in set order
    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    pub fn params(&self) -> &P {
        &self.params
    }

    pub fn artifact(&self, kind: ArtifactKind) -> Result<&Artifact> {
        self.artifacts
            .iter()
            .find(|a| a.kind() == kind)
            .ok_or_else(|| Error::precondition(format!("matrix cell has no {} artifact", kind)))
    }

    pub fn kernel(&self) -> Result<&Artifact> {
        self.artifact(ArtifactKind::Kernel)
    }

    pub fn disk(&self) -> Result<&Artifact> {
        self.artifact(ArtifactKind::Disk)
    }

    pub fn microvm(&self) -> Result<&Artifact> {
        self.artifact(ArtifactKind::Microvm)
    }

    fn label(&self) -> String {
        self.artifacts
            .iter()
            .map(Artifact::name)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Runs a test once per combination of its artifact sets.
///
/// The first set varies slowest. Cells run one at a time and the first
/// failing cell stops the run.
pub struct TestMatrix<P> {
    sets: Vec<ArtifactSet>,
    params: P,
}

impl<P: Clone> TestMatrix<P> {
    pub fn new(sets: Vec<ArtifactSet>, params: P) -> Self {
        Self { sets, params }
    }

    pub fn sets(&self) -> &[ArtifactSet] {
        &self.sets
    }

    /// Number of cells; zero when any set is empty.
    pub fn cell_count(&self) -> usize {
        self.sets.iter().map(ArtifactSet::len).product()
    }

    /// Every combination, first set slowest.
    pub fn combinations(&self) -> Vec<Vec<Artifact>> {
        let total = self.cell_count();
        let mut out = Vec::with_capacity(total);
        let mut digits = vec![0usize; self.sets.len()];
        for _ in 0..total {
            out.push(
                self.sets
                    .iter()
                    .zip(&digits)
                    .map(|(set, &i)| set.artifacts()[i].clone())
                    .collect(),
            );
            // Odometer: bump the last digit, carrying leftwards.
            for pos in (0..digits.len()).rev() {
                digits[pos] += 1;
                if digits[pos] < self.sets[pos].len() {
                    break;
                }
                digits[pos] = 0;
            }
        }
        out
    }

    /// Run `test` on every cell and return how many ran.
    ///
    /// Artifacts are materialized right before the first cell that uses
    /// them. The error of the first failing cell is returned with the
    /// cell's artifact names attached.
    pub async fn run<F, Fut>(&self, mut test: F) -> anyhow::Result<usize>
    where
        F: FnMut(MatrixCell<P>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let combinations = self.combinations();
        let total = combinations.len();
        for (index, artifacts) in combinations.into_iter().enumerate() {
            let cell = MatrixCell {
                index,
                artifacts,
                params: self.params.clone(),
            };
            let label = cell.label();
            for artifact in cell.artifacts() {
                artifact
                    .download()
                    .await
                    .with_context(|| format!("fetching artifacts for matrix cell [{}]", label))?;
            }
            info!(target: "matrix", cell = index + 1, total, artifacts = %label, "running matrix cell");
            test(cell)
                .await
                .with_context(|| format!("matrix cell {} [{}] failed", index + 1, label))?;
        }
        Ok(total)
    }
}
