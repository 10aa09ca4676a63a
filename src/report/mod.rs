//! In-memory performance report and the queries remote clients run against it.
//!
//! A [`Report`] holds three trees, metrics, call-tree nodes (cnodes) and system resources,
//! plus one exclusive severity per (metric, cnode, system resource) triple. Queries aggregate
//! severities over a selection of nodes of two trees and return one inclusive and one
//! exclusive [`Value`] per node of the third.
//!
//! # Selections
//!
//! A selection is a node id with a [`CalculationFlavour`]. An inclusive selection covers the
//! node and all of its descendants, an exclusive selection covers the node alone. An empty
//! selection list covers the whole tree.
//!
//! # Files
//!
//! Reports are stored as a single bincode document and validated on load.
//!
//! # Invariants
//!
//! - Node ids are their index in the tree.
//! - A parent always precedes its children, which keeps every tree acyclic.
use std::{
    fs::File,
    io::{self, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint, Limit},
    decode_from_std_read, encode_into_std_write,
};
use log::trace;
use thiserror::Error;

mod value;

pub use value::{DataType, Value};

/// Largest report file accepted by [`Report::open`].
pub const MAX_REPORT_BYTES: usize = 1 << 30;

type FileConfig = Configuration<BigEndian, Fixint, Limit<MAX_REPORT_BYTES>>;

fn file_config() -> FileConfig {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
        .with_limit::<MAX_REPORT_BYTES>()
}

/// Node id within one tree.
pub type NodeId = u32;

/// A node id together with how it contributes to an aggregation.
pub type Selection = (NodeId, CalculationFlavour);

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("unknown {tree} id {id}")]
    UnknownNode { tree: &'static str, id: NodeId },

    #[error("malformed {tree} tree at node {id}: {reason}")]
    MalformedTree {
        tree: &'static str,
        id: NodeId,
        reason: &'static str,
    },

    #[error("expected {expected} severities, found {found}")]
    ShapeMismatch { expected: usize, found: usize },

    #[error("unknown calculation flavour {0}")]
    UnknownFlavour(u8),

    #[error("unknown data type {0}")]
    UnknownDataType(u32),

    #[error("report path '{0}' is outside the report root")]
    OutsideRoot(PathBuf),

    #[error("report io error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to encode report: {0}")]
    Serialize(#[from] bincode::error::EncodeError),

    #[error("failed to decode report: {0}")]
    Deserialize(#[from] bincode::error::DecodeError),
}

/// Whether a selected node contributes with or without its descendants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalculationFlavour {
    Inclusive,
    Exclusive,
}

impl From<CalculationFlavour> for u8 {
    fn from(value: CalculationFlavour) -> Self {
        match value {
            CalculationFlavour::Inclusive => 0,
            CalculationFlavour::Exclusive => 1,
        }
    }
}

impl TryFrom<u8> for CalculationFlavour {
    type Error = ReportError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CalculationFlavour::Inclusive),
            1 => Ok(CalculationFlavour::Exclusive),
            other => Err(ReportError::UnknownFlavour(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct TreeNode {
    pub id: NodeId,
    pub name: String,
    pub parent: Option<NodeId>,
}

impl TreeNode {
    pub fn new(id: NodeId, name: &str, parent: Option<NodeId>) -> Self {
        Self {
            id,
            name: name.to_string(),
            parent,
        }
    }
}

/// What a client learns about a report when opening it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReportSummary {
    pub name: String,
    pub metrics: Vec<TreeNode>,
    pub cnodes: Vec<TreeNode>,
    pub sysres: Vec<TreeNode>,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct Report {
    name: String,
    metrics: Vec<TreeNode>,
    cnodes: Vec<TreeNode>,
    sysres: Vec<TreeNode>,
    /// Exclusive severities, metric-major: `(metric * cnodes + cnode) * sysres + sysres`.
    severities: Vec<f64>,
}

impl Report {
    /// Creates a report with all severities set to zero.
    pub fn new(
        name: &str,
        metrics: Vec<TreeNode>,
        cnodes: Vec<TreeNode>,
        sysres: Vec<TreeNode>,
    ) -> Result<Self, ReportError> {
        let size = severity_count(metrics.len(), cnodes.len(), sysres.len()).ok_or(
            ReportError::ShapeMismatch {
                expected: usize::MAX,
                found: 0,
            },
        )?;
        let report = Self {
            name: name.to_string(),
            metrics,
            cnodes,
            sysres,
            severities: vec![0.0; size],
        };
        report.validate()?;
        Ok(report)
    }

    pub fn open(path: &Path) -> Result<Self, ReportError> {
        let mut reader = BufReader::new(File::open(path)?);
        let report: Report = decode_from_std_read(&mut reader, file_config())?;
        report.validate()?;

        trace!("loaded report '{}' from {}", report.name, path.display());
        Ok(report)
    }

    pub fn save(&self, path: &Path) -> Result<(), ReportError> {
        let mut writer = BufWriter::new(File::create(path)?);
        encode_into_std_write(self, &mut writer, file_config())?;
        writer.flush()?;
        Ok(())
    }

    fn validate(&self) -> Result<(), ReportError> {
        validate_tree("metric", &self.metrics)?;
        validate_tree("cnode", &self.cnodes)?;
        validate_tree("sysres", &self.sysres)?;

        let found = self.severities.len();
        match severity_count(self.metrics.len(), self.cnodes.len(), self.sysres.len()) {
            Some(expected) if expected == found => {}
            expected => {
                return Err(ReportError::ShapeMismatch {
                    expected: expected.unwrap_or(usize::MAX),
                    found,
                });
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metrics(&self) -> &[TreeNode] {
        &self.metrics
    }

    pub fn cnodes(&self) -> &[TreeNode] {
        &self.cnodes
    }

    pub fn system_resources(&self) -> &[TreeNode] {
        &self.sysres
    }

    pub fn summary(&self) -> ReportSummary {
        ReportSummary {
            name: self.name.clone(),
            metrics: self.metrics.clone(),
            cnodes: self.cnodes.clone(),
            sysres: self.sysres.clone(),
        }
    }

    fn index(&self, metric: NodeId, cnode: NodeId, sysres: NodeId) -> Result<usize, ReportError> {
        let metric = checked("metric", metric, self.metrics.len())?;
        let cnode = checked("cnode", cnode, self.cnodes.len())?;
        let sysres = checked("sysres", sysres, self.sysres.len())?;
        Ok((metric * self.cnodes.len() + cnode) * self.sysres.len() + sysres)
    }

    pub fn severity(
        &self,
        metric: NodeId,
        cnode: NodeId,
        sysres: NodeId,
    ) -> Result<f64, ReportError> {
        Ok(self.severities[self.index(metric, cnode, sysres)?])
    }

    pub fn set_severity(
        &mut self,
        metric: NodeId,
        cnode: NodeId,
        sysres: NodeId,
        value: f64,
    ) -> Result<(), ReportError> {
        let index = self.index(metric, cnode, sysres)?;
        self.severities[index] = value;
        Ok(())
    }

    /// Inclusive and exclusive value of every metric, aggregated over the selected cnodes
    /// and system resources.
    pub fn metric_tree_values(
        &self,
        cnodes: &[Selection],
        sysres: &[Selection],
    ) -> Result<(Vec<Value>, Vec<Value>), ReportError> {
        let cnodes = expand("cnode", &self.cnodes, cnodes)?;
        let sysres = expand("sysres", &self.sysres, sysres)?;

        let exclusive = (0..self.metrics.len())
            .map(|metric| {
                let base = metric * self.cnodes.len();
                cnodes
                    .iter()
                    .flat_map(|&c| sysres.iter().map(move |&s| (c, s)))
                    .map(|(c, s)| self.severities[(base + c) * self.sysres.len() + s])
                    .sum::<f64>()
            })
            .collect::<Vec<_>>();

        Ok(with_inclusive(&self.metrics, exclusive))
    }

    /// Inclusive and exclusive value of every system resource, aggregated over the selected
    /// metrics and cnodes.
    pub fn system_tree_values(
        &self,
        metrics: &[Selection],
        cnodes: &[Selection],
    ) -> Result<(Vec<Value>, Vec<Value>), ReportError> {
        let metrics = expand("metric", &self.metrics, metrics)?;
        let cnodes = expand("cnode", &self.cnodes, cnodes)?;

        let mut exclusive = vec![0.0; self.sysres.len()];
        for &m in &metrics {
            for &c in &cnodes {
                let row = (m * self.cnodes.len() + c) * self.sysres.len();
                for (total, severity) in exclusive
                    .iter_mut()
                    .zip(&self.severities[row..row + self.sysres.len()])
                {
                    *total += severity;
                }
            }
        }

        Ok(with_inclusive(&self.sysres, exclusive))
    }

    /// Inclusive and exclusive value of every cnode, aggregated over the selected metrics
    /// and system resources.
    pub fn callpath_tree_values(
        &self,
        metrics: &[Selection],
        sysres: &[Selection],
    ) -> Result<(Vec<Value>, Vec<Value>), ReportError> {
        let metrics = expand("metric", &self.metrics, metrics)?;
        let sysres = expand("sysres", &self.sysres, sysres)?;

        let mut exclusive = vec![0.0; self.cnodes.len()];
        for &m in &metrics {
            for (c, total) in exclusive.iter_mut().enumerate() {
                let row = (m * self.cnodes.len() + c) * self.sysres.len();
                *total += sysres.iter().map(|&s| self.severities[row + s]).sum::<f64>();
            }
        }

        Ok(with_inclusive(&self.cnodes, exclusive))
    }

    /// Values of the metrics below `root`, at most `depth` levels down.
    ///
    /// Depth `0` yields the root alone. Inclusive values always cover the complete subtree
    /// of each metric, whatever the depth.
    pub fn metric_subtree_values(
        &self,
        cnodes: &[Selection],
        sysres: &[Selection],
        root: NodeId,
        depth: u64,
    ) -> Result<SubtreeValues, ReportError> {
        let root = checked("metric", root, self.metrics.len())?;
        let (inclusive, exclusive) = self.metric_tree_values(cnodes, sysres)?;

        let mut values = SubtreeValues::default();
        for index in subtree_within(&self.metrics, root, depth) {
            values.ids.push(self.metrics[index].id);
            values.inclusive.push(inclusive[index]);
            values.exclusive.push(exclusive[index]);
        }
        trace!(
            "metric subtree of {} to depth {depth}: {} metrics",
            self.metrics[root].name,
            values.ids.len()
        );
        Ok(values)
    }
}

/// Values of part of a tree, position `i` of each list belonging to node `ids[i]`.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SubtreeValues {
    pub ids: Vec<NodeId>,
    pub inclusive: Vec<Value>,
    pub exclusive: Vec<Value>,
}

/// Number of (metric, cnode, sysres) triples, `None` if it does not fit in memory.
fn severity_count(metrics: usize, cnodes: usize, sysres: usize) -> Option<usize> {
    metrics.checked_mul(cnodes)?.checked_mul(sysres)
}

fn checked(tree: &'static str, id: NodeId, len: usize) -> Result<usize, ReportError> {
    let index = id as usize;
    if index >= len {
        return Err(ReportError::UnknownNode { tree, id });
    }
    Ok(index)
}

fn validate_tree(tree: &'static str, nodes: &[TreeNode]) -> Result<(), ReportError> {
    for (index, node) in nodes.iter().enumerate() {
        if node.id as usize != index {
            return Err(ReportError::MalformedTree {
                tree,
                id: node.id,
                reason: "id does not match position",
            });
        }
        if let Some(parent) = node.parent {
            if parent >= node.id {
                return Err(ReportError::MalformedTree {
                    tree,
                    id: node.id,
                    reason: "parent must precede child",
                });
            }
        }
    }
    Ok(())
}

/// Node indices covered by `selections`, with repetitions for overlapping selections.
fn expand(
    tree: &'static str,
    nodes: &[TreeNode],
    selections: &[Selection],
) -> Result<Vec<usize>, ReportError> {
    if selections.is_empty() {
        return Ok((0..nodes.len()).collect());
    }

    let mut covered = Vec::new();
    for &(id, flavour) in selections {
        let root = checked(tree, id, nodes.len())?;
        match flavour {
            CalculationFlavour::Exclusive => covered.push(root),
            CalculationFlavour::Inclusive => covered.extend(subtree(nodes, root)),
        }
    }
    Ok(covered)
}

fn subtree(nodes: &[TreeNode], root: usize) -> Vec<usize> {
    let mut inside = vec![false; nodes.len()];
    inside[root] = true;

    for index in root + 1..nodes.len() {
        if let Some(parent) = nodes[index].parent {
            inside[index] = inside[parent as usize];
        }
    }

    (root..nodes.len()).filter(|&index| inside[index]).collect()
}

/// Nodes of the subtree under `root` no more than `depth` levels below it, in tree order.
fn subtree_within(nodes: &[TreeNode], root: usize, depth: u64) -> Vec<usize> {
    let mut level: Vec<Option<u64>> = vec![None; nodes.len()];
    level[root] = Some(0);

    for index in root + 1..nodes.len() {
        if let Some(parent) = nodes[index].parent {
            level[index] = level[parent as usize].map(|above| above + 1);
        }
    }

    (root..nodes.len())
        .filter(|&index| level[index].is_some_and(|below| below <= depth))
        .collect()
}

/// Pairs exclusive values with inclusive ones summed bottom-up over `nodes`.
fn with_inclusive(nodes: &[TreeNode], exclusive: Vec<f64>) -> (Vec<Value>, Vec<Value>) {
    let mut inclusive = exclusive.clone();
    for index in (0..nodes.len()).rev() {
        if let Some(parent) = nodes[index].parent {
            inclusive[parent as usize] += inclusive[index];
        }
    }

    (
        inclusive.into_iter().map(Value::Double).collect(),
        exclusive.into_iter().map(Value::Double).collect(),
    )
}
