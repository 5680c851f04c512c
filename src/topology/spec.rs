use crate::error::{DiffuseError, Result};
use crate::types::Rank;
use std::fmt;
use std::str::FromStr;

/// A directed edge of a custom topology: `src` sends to `dst`.
///
/// `weight` is the coefficient `dst` applies to `src`'s contribution. Either
/// every edge of a custom topology carries a weight or none does.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub src: Rank,
    pub dst: Rank,
    pub weight: Option<f64>,
}

impl Edge {
    pub fn new(src: Rank, dst: Rank) -> Self {
        Self {
            src,
            dst,
            weight: None,
        }
    }

    pub fn weighted(src: Rank, dst: Rank, weight: f64) -> Self {
        Self {
            src,
            dst,
            weight: Some(weight),
        }
    }
}

/// Declarative description of a topology family.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum TopologySpec {
    /// Bidirectional ring; uniform weights over self and both neighbors.
    #[default]
    Ring,
    /// One-directional ring: rank `i` sends to `i + 1`, or to `i - 1` when
    /// `left` is set. Self and the single in-neighbor weigh one half each.
    OneWayRing { left: bool },
    /// Every rank exchanges with `center` only.
    Star { center: Rank },
    /// Every rank exchanges with every other rank.
    Full,
    /// Rank `i` sends to `i + 2^k (mod n)` for every `2^k < n`.
    ExponentialTwo,
    /// Explicit edge list.
    Custom { edges: Vec<Edge> },
}

impl TopologySpec {
    /// Short family name for logs.
    pub fn family(&self) -> &'static str {
        match self {
            TopologySpec::Ring => "ring",
            TopologySpec::OneWayRing { .. } => "one-way-ring",
            TopologySpec::Star { .. } => "star",
            TopologySpec::Full => "full",
            TopologySpec::ExponentialTwo => "exponential-2",
            TopologySpec::Custom { .. } => "custom",
        }
    }
}

impl fmt::Display for TopologySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologySpec::Star { center } => write!(f, "star:{center}"),
            TopologySpec::OneWayRing { left: true } => f.write_str("ring:left"),
            TopologySpec::OneWayRing { left: false } => f.write_str("ring:right"),
            TopologySpec::Custom { edges } => {
                f.write_str("custom:")?;
                for (i, e) in edges.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}->{}", e.src, e.dst)?;
                    if let Some(w) = e.weight {
                        write!(f, "@{w}")?;
                    }
                }
                Ok(())
            }
            other => f.write_str(other.family()),
        }
    }
}

/// Parse a topology description.
///
/// Formats: `ring`, `ring:left`, `ring:right`, `star`, `star:3`, `full`,
/// `exponential-2`, `custom:0->1,1->2@0.5,...`
impl FromStr for TopologySpec {
    type Err = DiffuseError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_lowercase();
        match s.as_str() {
            "ring" => return Ok(TopologySpec::Ring),
            "ring:left" => return Ok(TopologySpec::OneWayRing { left: true }),
            "ring:right" => return Ok(TopologySpec::OneWayRing { left: false }),
            "star" => return Ok(TopologySpec::Star { center: 0 }),
            "full" => return Ok(TopologySpec::Full),
            "exponential-2" => return Ok(TopologySpec::ExponentialTwo),
            _ => {}
        }

        if let Some(rest) = s.strip_prefix("star:") {
            let center = rest
                .parse::<Rank>()
                .map_err(|e| DiffuseError::config(format!("star center {rest:?}: {e}")))?;
            return Ok(TopologySpec::Star { center });
        }

        if let Some(rest) = s.strip_prefix("custom:") {
            let edges = rest
                .split(',')
                .filter(|part| !part.trim().is_empty())
                .map(parse_edge)
                .collect::<Result<Vec<_>>>()?;
            if edges.is_empty() {
                return Err(DiffuseError::config("custom topology has no edges"));
            }
            return Ok(TopologySpec::Custom { edges });
        }

        Err(DiffuseError::config(format!(
            "unknown topology {s:?} (expected ring[:left|:right], star[:c], full, exponential-2, custom:...)"
        )))
    }
}

fn parse_edge(part: &str) -> Result<Edge> {
    let part = part.trim();
    let (pair, weight) = match part.split_once('@') {
        Some((pair, w)) => {
            let w = w
                .trim()
                .parse::<f64>()
                .map_err(|e| DiffuseError::config(format!("edge weight in {part:?}: {e}")))?;
            (pair, Some(w))
        }
        None => (part, None),
    };
    let (src, dst) = pair
        .split_once("->")
        .ok_or_else(|| DiffuseError::config(format!("edge {part:?} must look like a->b")))?;
    let src = src
        .trim()
        .parse::<Rank>()
        .map_err(|e| DiffuseError::config(format!("edge source in {part:?}: {e}")))?;
    let dst = dst
        .trim()
        .parse::<Rank>()
        .map_err(|e| DiffuseError::config(format!("edge target in {part:?}: {e}")))?;
    Ok(Edge { src, dst, weight })
}
