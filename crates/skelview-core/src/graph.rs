//! Skeleton graph topology and partitioned adjacency construction.
//!
//! A skeleton layout (joint count, bone list, center joint) is turned into a
//! stack of `K` normalised adjacency matrices of shape `(K, V, V)`. Each of the
//! `K` partitions becomes one spatial kernel of the graph convolution.
//!
//! ## Partition Strategies
//!
//! - **Uniform**: a single matrix holding every neighbour within `max_hop`
//! - **Distance**: one matrix per hop distance
//! - **Spatial**: per hop, joints are split by their distance to the skeleton
//!   center into root, closer and further groups (K = 3 for `max_hop = 1`)

use std::fmt;
use std::str::FromStr;

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Sentinel for joint pairs further apart than `max_hop`
const UNREACHABLE: usize = usize::MAX;

/// OpenPose 18-joint skeleton, 0-based
const OPENPOSE_LINKS: [(usize, usize); 17] = [
    (4, 3),
    (3, 2),
    (7, 6),
    (6, 5),
    (13, 12),
    (12, 11),
    (10, 9),
    (9, 8),
    (11, 5),
    (8, 2),
    (5, 1),
    (2, 1),
    (0, 1),
    (15, 0),
    (14, 0),
    (17, 15),
    (16, 14),
];

/// NTU RGB+D 25-joint Kinect skeleton, 1-based
const NTU_RGBD_LINKS: [(usize, usize); 24] = [
    (1, 2),
    (2, 21),
    (3, 21),
    (4, 3),
    (5, 21),
    (6, 5),
    (7, 6),
    (8, 7),
    (9, 21),
    (10, 9),
    (11, 10),
    (12, 11),
    (13, 1),
    (14, 13),
    (15, 14),
    (16, 15),
    (17, 1),
    (18, 17),
    (19, 18),
    (20, 19),
    (22, 23),
    (23, 8),
    (24, 25),
    (25, 12),
];

/// NTU RGB+D bone graph (24 bones as vertices), 1-based
const NTU_EDGE_LINKS: [(usize, usize); 23] = [
    (1, 2),
    (3, 2),
    (4, 3),
    (5, 2),
    (6, 5),
    (7, 6),
    (8, 7),
    (9, 2),
    (10, 9),
    (11, 10),
    (12, 11),
    (13, 1),
    (14, 13),
    (15, 14),
    (16, 15),
    (17, 1),
    (18, 17),
    (19, 18),
    (20, 19),
    (21, 22),
    (22, 8),
    (23, 24),
    (24, 12),
];

/// Skeleton topology
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Layout {
    /// OpenPose 18 keypoints, centered on the neck
    #[serde(rename = "openpose")]
    #[default]
    OpenPose,
    /// NTU RGB+D 25 Kinect joints, centered on the spine
    #[serde(rename = "ntu-rgb+d")]
    NtuRgbD,
    /// NTU RGB+D bones as vertices
    #[serde(rename = "ntu_edge")]
    NtuEdge,
    /// User-supplied topology with 0-based neighbour pairs
    #[serde(rename = "custom")]
    Custom {
        num_node: usize,
        edges: Vec<(usize, usize)>,
        center: usize,
    },
}

impl Layout {
    /// Joint count, neighbour links (0-based, without self links) and center joint
    fn skeleton(&self) -> Result<(usize, Vec<(usize, usize)>, usize)> {
        let (num_node, links, center) = match self {
            Layout::OpenPose => (18, OPENPOSE_LINKS.to_vec(), 1),
            Layout::NtuRgbD => (25, zero_based(&NTU_RGBD_LINKS), 21 - 1),
            Layout::NtuEdge => (24, zero_based(&NTU_EDGE_LINKS), 2),
            Layout::Custom {
                num_node,
                edges,
                center,
            } => (*num_node, edges.clone(), *center),
        };

        if num_node == 0 {
            return Err(Error::InvalidTopology("skeleton has no vertices".into()));
        }
        if center >= num_node {
            return Err(Error::InvalidTopology(format!(
                "center joint {center} out of range for {num_node} vertices"
            )));
        }
        if let Some(&(i, j)) = links.iter().find(|&&(i, j)| i >= num_node || j >= num_node) {
            return Err(Error::InvalidTopology(format!(
                "edge ({i}, {j}) out of range for {num_node} vertices"
            )));
        }

        Ok((num_node, links, center))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Layout::OpenPose => "openpose",
            Layout::NtuRgbD => "ntu-rgb+d",
            Layout::NtuEdge => "ntu_edge",
            Layout::Custom { .. } => "custom",
        }
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Layout {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "openpose" => Ok(Layout::OpenPose),
            "ntu-rgb+d" => Ok(Layout::NtuRgbD),
            "ntu_edge" => Ok(Layout::NtuEdge),
            other => Err(Error::UnknownLayout(other.to_string())),
        }
    }
}

fn zero_based(links: &[(usize, usize)]) -> Vec<(usize, usize)> {
    links.iter().map(|&(i, j)| (i - 1, j - 1)).collect()
}

/// Neighbourhood partitioning strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Uniform,
    Distance,
    #[default]
    Spatial,
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "uniform" => Ok(Strategy::Uniform),
            "distance" => Ok(Strategy::Distance),
            "spatial" => Ok(Strategy::Spatial),
            other => Err(Error::UnknownStrategy(other.to_string())),
        }
    }
}

/// Graph topology configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub layout: Layout,
    pub strategy: Strategy,
    /// Largest hop distance treated as a neighbour
    pub max_hop: usize,
    /// Step between the hop distances that are kept
    pub dilation: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            layout: Layout::OpenPose,
            strategy: Strategy::Spatial,
            max_hop: 1,
            dilation: 1,
        }
    }
}

/// Partitioned skeleton adjacency, immutable after construction
#[derive(Debug, Clone)]
pub struct Graph {
    num_node: usize,
    center: usize,
    edges: Vec<(usize, usize)>,
    hop_distance: Vec<usize>,
    num_partitions: usize,
    /// Row-major (K, V, V)
    adjacency: Vec<f32>,
}

impl Graph {
    pub fn new(config: &GraphConfig) -> Result<Self> {
        if config.dilation == 0 {
            return Err(Error::InvalidTopology("dilation must be at least 1".into()));
        }

        let (num_node, links, center) = config.layout.skeleton()?;

        let mut edges: Vec<(usize, usize)> = (0..num_node).map(|i| (i, i)).collect();
        edges.extend(links);

        let hop_distance = hop_distance(num_node, &edges, config.max_hop);
        let valid_hops: Vec<usize> = (0..=config.max_hop).step_by(config.dilation).collect();

        let matrices = partition(
            num_node,
            center,
            &hop_distance,
            &valid_hops,
            config.strategy,
        );
        let num_partitions = matrices.len();
        let adjacency = matrices
            .into_iter()
            .flatten()
            .map(|value| value as f32)
            .collect();

        tracing::debug!(
            layout = %config.layout,
            strategy = ?config.strategy,
            num_node,
            num_partitions,
            "built skeleton graph"
        );

        Ok(Self {
            num_node,
            center,
            edges,
            hop_distance,
            num_partitions,
            adjacency,
        })
    }

    /// Vertex count V
    pub fn num_node(&self) -> usize {
        self.num_node
    }

    /// Partition count K
    pub fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    pub fn center(&self) -> usize {
        self.center
    }

    /// Undirected edges including one self link per vertex
    pub fn edges(&self) -> &[(usize, usize)] {
        &self.edges
    }

    /// Shortest path length between two joints, `None` beyond `max_hop`
    pub fn hop_distance(&self, i: usize, j: usize) -> Option<usize> {
        match self.hop_distance[i * self.num_node + j] {
            UNREACHABLE => None,
            d => Some(d),
        }
    }

    /// Row-major `(K, V, V)` adjacency values
    pub fn adjacency(&self) -> &[f32] {
        &self.adjacency
    }

    /// Single entry `A[k][row][col]`
    pub fn entry(&self, k: usize, row: usize, col: usize) -> f32 {
        let v = self.num_node;
        self.adjacency[k * v * v + row * v + col]
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        (self.num_partitions, self.num_node, self.num_node)
    }

    /// Adjacency as a `(K, V, V)` f32 tensor on `device`
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_slice(&self.adjacency, self.shape(), device)?)
    }
}

/// Breadth-first hop distances capped at `max_hop`, row-major (V, V)
fn hop_distance(num_node: usize, edges: &[(usize, usize)], max_hop: usize) -> Vec<usize> {
    let mut neighbours = vec![Vec::new(); num_node];
    for &(i, j) in edges {
        neighbours[i].push(j);
        neighbours[j].push(i);
    }

    let mut distance = vec![UNREACHABLE; num_node * num_node];
    for source in 0..num_node {
        let row = &mut distance[source * num_node..(source + 1) * num_node];
        row[source] = 0;
        let mut frontier = vec![source];

        for hop in 1..=max_hop {
            let mut next = Vec::new();
            for &node in &frontier {
                for &n in &neighbours[node] {
                    if row[n] == UNREACHABLE {
                        row[n] = hop;
                        next.push(n);
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
    }

    distance
}

/// Column-normalised adjacency: `A * diag(1 / column_sum)`
fn normalize_digraph(adjacency: &[f64], num_node: usize) -> Vec<f64> {
    let column_sums: Vec<f64> = (0..num_node)
        .map(|col| (0..num_node).map(|row| adjacency[row * num_node + col]).sum())
        .collect();

    let mut normalized = vec![0.0; num_node * num_node];
    for row in 0..num_node {
        for col in 0..num_node {
            if column_sums[col] > 0.0 {
                normalized[row * num_node + col] =
                    adjacency[row * num_node + col] / column_sums[col];
            }
        }
    }
    normalized
}

fn partition(
    num_node: usize,
    center: usize,
    hop: &[usize],
    valid_hops: &[usize],
    strategy: Strategy,
) -> Vec<Vec<f64>> {
    let size = num_node * num_node;

    let mut adjacency = vec![0.0; size];
    for (slot, &d) in adjacency.iter_mut().zip(hop) {
        if valid_hops.contains(&d) {
            *slot = 1.0;
        }
    }
    let normalized = normalize_digraph(&adjacency, num_node);

    match strategy {
        Strategy::Uniform => vec![normalized],
        Strategy::Distance => valid_hops
            .iter()
            .map(|&h| {
                hop.iter()
                    .zip(&normalized)
                    .map(|(&d, &value)| if d == h { value } else { 0.0 })
                    .collect()
            })
            .collect(),
        Strategy::Spatial => {
            let mut matrices = Vec::new();
            for &h in valid_hops {
                let mut root = vec![0.0; size];
                let mut closer = vec![0.0; size];
                let mut further = vec![0.0; size];

                for i in 0..num_node {
                    for j in 0..num_node {
                        let idx = j * num_node + i;
                        if hop[idx] != h {
                            continue;
                        }
                        let j_to_center = hop[j * num_node + center];
                        let i_to_center = hop[i * num_node + center];
                        if j_to_center == i_to_center {
                            root[idx] = normalized[idx];
                        } else if j_to_center > i_to_center {
                            closer[idx] = normalized[idx];
                        } else {
                            further[idx] = normalized[idx];
                        }
                    }
                }

                if h == 0 {
                    matrices.push(root);
                } else {
                    matrices.push(root.iter().zip(&closer).map(|(a, b)| a + b).collect());
                    matrices.push(further);
                }
            }
            matrices
        }
    }
}
