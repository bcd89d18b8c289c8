//! Central-difference gradient checking.
//!
//! Diagnostic only: every checked scalar costs two full loss evaluations.
//! The check always restores perturbed values and clears the gradient
//! accumulators before returning, so a model can be checked and then
//! trained without side effects.

use std::io::Write;

use tracing::{info, warn};

use super::model::RnnLm;
use super::params::DenseParam;
use super::tree::NodeId;
use super::ModelError;

/// Result of checking one parameter group.
#[derive(Debug, Clone, PartialEq)]
pub struct GradCheckEntry {
    /// Group label: `H`, `W`, `U`, `L[i]` or `tree`.
    pub name: String,
    /// Euclidean norm of (numerical - analytic).
    pub error_norm: f64,
    /// Number of scalars compared.
    pub elements: usize,
    pub passed: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GradCheckReport {
    pub entries: Vec<GradCheckEntry>,
}

impl GradCheckReport {
    /// True when every group is within tolerance.
    pub fn passed(&self) -> bool {
        self.entries.iter().all(|e| e.passed)
    }

    pub fn entry(&self, name: &str) -> Option<&GradCheckEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn max_error(&self) -> f64 {
        self.entries.iter().map(|e| e.error_norm).fold(0.0, f64::max)
    }
}

/// A perturbable parameter slice.
#[derive(Debug, Clone, Copy)]
enum ParamRef {
    Dense(DenseParam),
    Embedding(usize),
    Node(NodeId),
}

impl RnnLm {
    /// Compare the accumulated gradient of `compute_seq_loss(xs, ys)` with
    /// central differences of step `eps`, writing one line per group to `out`.
    ///
    /// The truncation window is widened to the full sequence for the duration
    /// of the check and restored afterwards.
    pub fn grad_check<W: Write>(
        &mut self,
        xs: &[usize],
        ys: &[usize],
        eps: f64,
        tol: f64,
        out: &mut W,
    ) -> Result<GradCheckReport, ModelError> {
        let saved_bptt = self.bptt();
        self.set_bptt(ys.len());

        let result = self.run_grad_check(xs, ys, eps, tol, out);

        self.set_bptt(saved_bptt);
        self.reset_gradients();
        writeln!(out, "Reset bptt = {}", saved_bptt)?;

        let report = result?;
        info!(
            groups = report.entries.len(),
            max_error = report.max_error(),
            passed = report.passed(),
            "Gradient check finished"
        );
        Ok(report)
    }

    fn run_grad_check<W: Write>(
        &mut self,
        xs: &[usize],
        ys: &[usize],
        eps: f64,
        tol: f64,
        out: &mut W,
    ) -> Result<GradCheckReport, ModelError> {
        writeln!(
            out,
            "NOTE: temporarily setting bptt = len(ys) = {} for the full gradient",
            ys.len()
        )?;
        self.reset_gradients();
        self.accumulate_gradients(xs, ys)?;

        let mut report = GradCheckReport::default();

        for name in self.params().dense_names() {
            let analytic = match self.params().grad(name) {
                Some(g) => g.as_slice().to_vec(),
                None => continue,
            };
            let numerical = self.numerical_gradient(xs, ys, &[ParamRef::Dense(name)], eps)?;
            let shape = self.params().value(name).map(|m| m.shape()).unwrap_or_default();
            let entry = compare(name.to_string(), &numerical, &analytic, tol);
            write_entry(out, &entry, Some(shape))?;
            report.entries.push(entry);
        }

        let tree_grads = self.tree().map(|tree| {
            let nodes = tree.touched_nodes();
            let analytic: Vec<f64> = nodes
                .iter()
                .flat_map(|&id| tree.grad(id).unwrap_or_default().to_vec())
                .collect();
            (nodes, analytic)
        });
        if let Some((nodes, analytic)) = tree_grads {
            let refs: Vec<ParamRef> = nodes.into_iter().map(ParamRef::Node).collect();
            let numerical = self.numerical_gradient(xs, ys, &refs, eps)?;
            let entry = compare("tree".to_string(), &numerical, &analytic, tol);
            write_entry(out, &entry, None)?;
            report.entries.push(entry);
        }

        let rows: Vec<(usize, Vec<f64>)> = self
            .params()
            .sparse_grads()
            .map(|(i, g)| (i, g.to_vec()))
            .collect();
        for (row, analytic) in rows {
            let numerical = self.numerical_gradient(xs, ys, &[ParamRef::Embedding(row)], eps)?;
            let entry = compare(format!("L[{}]", row), &numerical, &analytic, tol);
            write_entry(out, &entry, Some((1, analytic.len())))?;
            report.entries.push(entry);
        }

        Ok(report)
    }

    /// Central differences for every scalar behind `refs`, in order.
    fn numerical_gradient(
        &mut self,
        xs: &[usize],
        ys: &[usize],
        refs: &[ParamRef],
        eps: f64,
    ) -> Result<Vec<f64>, ModelError> {
        let mut approx = Vec::new();
        for &param in refs {
            let len = self.slot_mut(param).map(|s| s.len()).unwrap_or(0);
            for k in 0..len {
                approx.push(self.central_difference(xs, ys, param, k, eps)?);
            }
        }
        Ok(approx)
    }

    fn central_difference(
        &mut self,
        xs: &[usize],
        ys: &[usize],
        param: ParamRef,
        k: usize,
        eps: f64,
    ) -> Result<f64, ModelError> {
        let original = match self.slot_mut(param) {
            Some(slot) => slot[k],
            None => return Ok(0.0),
        };

        self.set_scalar(param, k, original + eps);
        let plus = self.compute_seq_loss(xs, ys);
        self.set_scalar(param, k, original - eps);
        let minus = self.compute_seq_loss(xs, ys);
        self.set_scalar(param, k, original);

        Ok((plus? - minus?) / (2.0 * eps))
    }

    fn set_scalar(&mut self, param: ParamRef, k: usize, value: f64) {
        if let Some(slot) = self.slot_mut(param) {
            slot[k] = value;
        }
    }

    fn slot_mut(&mut self, param: ParamRef) -> Option<&mut [f64]> {
        match param {
            ParamRef::Dense(name) => self.params_mut().value_mut(name).map(|m| m.as_mut_slice()),
            ParamRef::Embedding(row) => Some(self.params_mut().embeddings_mut().row_mut(row)),
            ParamRef::Node(id) => self.tree_mut()?.weights_mut(id),
        }
    }
}

fn compare(name: String, numerical: &[f64], analytic: &[f64], tol: f64) -> GradCheckEntry {
    let error_norm = numerical
        .iter()
        .zip(analytic)
        .map(|(n, a)| (n - a) * (n - a))
        .sum::<f64>()
        .sqrt();
    let passed = error_norm < tol && numerical.len() == analytic.len();
    if passed {
        info!(group = %name, error_norm, "Gradient group ok");
    } else {
        warn!(group = %name, error_norm, tol, "Gradient mismatch");
    }
    GradCheckEntry {
        name,
        error_norm,
        elements: analytic.len(),
        passed,
    }
}

fn write_entry<W: Write>(
    out: &mut W,
    entry: &GradCheckEntry,
    shape: Option<(usize, usize)>,
) -> Result<(), ModelError> {
    writeln!(
        out,
        "grad_check: dJ/d{} error norm = {:.4e} {}",
        entry.name,
        entry.error_norm,
        if entry.passed { "[ok]" } else { "**ERROR**" }
    )?;
    match shape {
        Some((rows, cols)) => writeln!(
            out,
            "    {} dims: [{}, {}] = {} elem",
            entry.name, rows, cols, entry.elements
        )?,
        None => writeln!(out, "    {} = {} elem", entry.name, entry.elements)?,
    }
    Ok(())
}
