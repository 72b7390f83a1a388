//! Typed configuration records and their parsers.
//!
//! Two files configure a run: the system configuration (scalar parameters
//! plus the thread and queue mapping tables) and the pipeline description
//! (element instances and port connections). Both parse into typed records
//! before any thread is spawned; the fast path never sees text.

use std::collections::HashMap;
use std::fmt::Write as _;

use crate::error::{Error, Result};

/// Recognized scalar parameters, in canonical write-back order, with
/// their defaults.
pub const RECOGNIZED_PARAMS: &[(&str, u64)] = &[
    ("NUM_RXQ_PER_PORT", 1),
    ("IO_DESC_PER_HWRXQ", 1024),
    ("IO_DESC_PER_HWTXQ", 1024),
    ("IO_BATCH_SIZE", 32),
    ("COMP_BATCH_SIZE", 32),
    ("COPROC_PPDEPTH", 32),
    ("COPROC_INPUTQ_LENGTH", 256),
    ("COPROC_COMPLETIONQ_LENGTH", 256),
    ("COPROC_CTX_PER_COMPTHREAD", 2),
    ("BATCHPOOL_SIZE", 512),
    ("TASKPOOL_SIZE", 256),
];

/// Role a software queue is created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueTemplate {
    /// I/O thread to computation thread batch ring.
    SwRx,
    /// Computation threads to coprocessor task ring.
    TaskIn,
    /// Coprocessor to computation thread completion ring.
    TaskOut,
}

/// One software queue declaration.
#[derive(Debug, Clone)]
pub struct QueueConf {
    /// Queue role.
    pub template: QueueTemplate,
    /// NUMA node the ring memory belongs to.
    pub node_id: usize,
}

/// Placement and attachments of one I/O thread.
#[derive(Debug, Clone)]
pub struct IoThreadConf {
    /// Core the thread pins to.
    pub core_id: usize,
    /// Hardware RX queues (port, queue) the thread polls.
    pub attached_rxqs: Vec<(u16, u16)>,
    /// SW-RX queue index the thread produces into.
    pub swrxq_idx: usize,
}

/// Placement and attachments of one computation thread.
#[derive(Debug, Clone)]
pub struct CompThreadConf {
    /// Core the thread pins to.
    pub core_id: usize,
    /// SW-RX queue index the thread consumes.
    pub swrxq_idx: usize,
    /// Task-input queue toward the node's coprocessor, if any.
    pub taskinq_idx: Option<usize>,
    /// Completion queue owned by this thread, if offloading.
    pub taskoutq_idx: Option<usize>,
}

/// Placement of one coprocessor thread.
#[derive(Debug, Clone)]
pub struct CoprocThreadConf {
    /// Core the thread pins to.
    pub core_id: usize,
    /// Device ordinal on this node.
    pub device_id: usize,
    /// Task-input queue the thread consumes.
    pub taskinq_idx: usize,
}

/// Parsed system configuration.
#[derive(Debug, Clone, Default)]
pub struct SystemConfig {
    /// Scalar parameters (recognized keys only).
    pub params: HashMap<String, u64>,
    /// Software queue declarations, indexed by position.
    pub queues: Vec<QueueConf>,
    /// I/O thread table.
    pub io_threads: Vec<IoThreadConf>,
    /// Computation thread table.
    pub comp_threads: Vec<CompThreadConf>,
    /// Coprocessor thread table.
    pub coproc_threads: Vec<CoprocThreadConf>,
}

impl SystemConfig {
    /// Read a parameter, falling back to its default.
    pub fn param(&self, key: &str) -> u64 {
        if let Some(v) = self.params.get(key) {
            return *v;
        }
        RECOGNIZED_PARAMS
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, d)| *d)
            .unwrap_or(0)
    }

    /// Parse the line-based system configuration format.
    pub fn parse(text: &str) -> Result<Self> {
        let mut cfg = SystemConfig::default();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut tokens = line.split_whitespace();
            let head = tokens.next().unwrap();
            let rest: Vec<&str> = tokens.collect();
            match head {
                "queue" => cfg.queues.push(parse_queue(&rest, lineno)?),
                "io_thread" => cfg.io_threads.push(parse_io_thread(&rest, lineno)?),
                "comp_thread" => cfg.comp_threads.push(parse_comp_thread(&rest, lineno)?),
                "coproc_thread" => cfg.coproc_threads.push(parse_coproc_thread(&rest, lineno)?),
                key => {
                    if !RECOGNIZED_PARAMS.iter().any(|(k, _)| *k == key) {
                        return Err(Error::Config(format!(
                            "line {}: unrecognized key '{}'",
                            lineno + 1,
                            key
                        )));
                    }
                    let value = rest
                        .first()
                        .ok_or_else(|| {
                            Error::Config(format!("line {}: '{}' needs a value", lineno + 1, key))
                        })?
                        .parse::<u64>()
                        .map_err(|_| {
                            Error::Config(format!(
                                "line {}: invalid value for '{}'",
                                lineno + 1,
                                key
                            ))
                        })?;
                    cfg.params.insert(key.to_string(), value);
                }
            }
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Emit the recognized scalar parameters in canonical order.
    pub fn write_params(&self) -> String {
        let mut out = String::new();
        for (key, _) in RECOGNIZED_PARAMS {
            if let Some(value) = self.params.get(*key) {
                let _ = writeln!(out, "{} {}", key, value);
            }
        }
        out
    }

    /// Cross-check queue indices and thread attachments.
    pub fn validate(&self) -> Result<()> {
        let check = |idx: usize, want: QueueTemplate, who: &str| -> Result<()> {
            match self.queues.get(idx) {
                Some(q) if q.template == want => Ok(()),
                Some(q) => Err(Error::Config(format!(
                    "{} references queue {} of role {:?}, expected {:?}",
                    who, idx, q.template, want
                ))),
                None => Err(Error::Config(format!(
                    "{} references undeclared queue {}",
                    who, idx
                ))),
            }
        };
        for (i, io) in self.io_threads.iter().enumerate() {
            check(io.swrxq_idx, QueueTemplate::SwRx, &format!("io_thread {}", i))?;
            if io.attached_rxqs.is_empty() {
                return Err(Error::Config(format!("io_thread {} has no RX queues", i)));
            }
        }
        for (i, comp) in self.comp_threads.iter().enumerate() {
            check(comp.swrxq_idx, QueueTemplate::SwRx, &format!("comp_thread {}", i))?;
            if let Some(idx) = comp.taskinq_idx {
                check(idx, QueueTemplate::TaskIn, &format!("comp_thread {}", i))?;
            }
            if let Some(idx) = comp.taskoutq_idx {
                check(idx, QueueTemplate::TaskOut, &format!("comp_thread {}", i))?;
            }
            if comp.taskinq_idx.is_some() != comp.taskoutq_idx.is_some() {
                return Err(Error::Config(format!(
                    "comp_thread {} must attach both task queues or neither",
                    i
                )));
            }
        }
        for (i, coproc) in self.coproc_threads.iter().enumerate() {
            check(coproc.taskinq_idx, QueueTemplate::TaskIn, &format!("coproc_thread {}", i))?;
        }
        // Every SW-RX ring pairs one producer I/O thread with one consumer.
        for (i, comp) in self.comp_threads.iter().enumerate() {
            if !self.io_threads.iter().any(|io| io.swrxq_idx == comp.swrxq_idx) {
                return Err(Error::Config(format!(
                    "comp_thread {} consumes SW-RX queue {} that no io_thread feeds",
                    i, comp.swrxq_idx
                )));
            }
        }
        Ok(())
    }

    /// A single-node layout with `pairs` I/O/computation thread pairs on
    /// consecutive cores, optionally with a coprocessor tier.
    pub fn single_node(pairs: usize, ports: usize, with_coproc: bool) -> Self {
        let mut cfg = SystemConfig::default();
        for _ in 0..pairs {
            cfg.queues.push(QueueConf {
                template: QueueTemplate::SwRx,
                node_id: 0,
            });
        }
        let taskin_idx = if with_coproc {
            cfg.queues.push(QueueConf {
                template: QueueTemplate::TaskIn,
                node_id: 0,
            });
            Some(cfg.queues.len() - 1)
        } else {
            None
        };
        for i in 0..pairs {
            let taskout_idx = if with_coproc {
                cfg.queues.push(QueueConf {
                    template: QueueTemplate::TaskOut,
                    node_id: 0,
                });
                Some(cfg.queues.len() - 1)
            } else {
                None
            };
            let rxqs = (0..ports as u16).map(|p| (p, i as u16)).collect();
            cfg.io_threads.push(IoThreadConf {
                core_id: 2 * i,
                attached_rxqs: rxqs,
                swrxq_idx: i,
            });
            cfg.comp_threads.push(CompThreadConf {
                core_id: 2 * i + 1,
                swrxq_idx: i,
                taskinq_idx: taskin_idx,
                taskoutq_idx: taskout_idx,
            });
        }
        if let Some(idx) = taskin_idx {
            cfg.coproc_threads.push(CoprocThreadConf {
                core_id: 2 * pairs,
                device_id: 0,
                taskinq_idx: idx,
            });
        }
        cfg
    }
}

fn kv<'a>(rest: &'a [&'a str], key: &str) -> Option<&'a str> {
    rest.iter()
        .position(|t| *t == key)
        .and_then(|i| rest.get(i + 1))
        .copied()
}

fn kv_usize(rest: &[&str], key: &str, lineno: usize) -> Result<usize> {
    kv(rest, key)
        .ok_or_else(|| Error::Config(format!("line {}: missing '{}'", lineno + 1, key)))?
        .parse()
        .map_err(|_| Error::Config(format!("line {}: invalid '{}'", lineno + 1, key)))
}

fn parse_queue(rest: &[&str], lineno: usize) -> Result<QueueConf> {
    let template = match rest.first().copied() {
        Some("swrx") => QueueTemplate::SwRx,
        Some("taskin") => QueueTemplate::TaskIn,
        Some("taskout") => QueueTemplate::TaskOut,
        other => {
            return Err(Error::Config(format!(
                "line {}: unknown queue template {:?}",
                lineno + 1,
                other
            )))
        }
    };
    Ok(QueueConf {
        template,
        node_id: kv_usize(rest, "node", lineno).unwrap_or(0),
    })
}

fn parse_io_thread(rest: &[&str], lineno: usize) -> Result<IoThreadConf> {
    let mut attached_rxqs = Vec::new();
    let mut iter = rest.iter();
    while let Some(tok) = iter.next() {
        if *tok == "rxq" {
            let spec = iter.next().ok_or_else(|| {
                Error::Config(format!("line {}: 'rxq' needs port:queue", lineno + 1))
            })?;
            let (port, queue) = spec.split_once(':').ok_or_else(|| {
                Error::Config(format!("line {}: rxq spec '{}' is not port:queue", lineno + 1, spec))
            })?;
            let port = port.parse().map_err(|_| {
                Error::Config(format!("line {}: invalid rxq port '{}'", lineno + 1, port))
            })?;
            let queue = queue.parse().map_err(|_| {
                Error::Config(format!("line {}: invalid rxq queue '{}'", lineno + 1, queue))
            })?;
            attached_rxqs.push((port, queue));
        }
    }
    Ok(IoThreadConf {
        core_id: kv_usize(rest, "core", lineno)?,
        attached_rxqs,
        swrxq_idx: kv_usize(rest, "swrxq", lineno)?,
    })
}

fn parse_comp_thread(rest: &[&str], lineno: usize) -> Result<CompThreadConf> {
    Ok(CompThreadConf {
        core_id: kv_usize(rest, "core", lineno)?,
        swrxq_idx: kv_usize(rest, "swrxq", lineno)?,
        taskinq_idx: kv(rest, "taskinq").map(|v| v.parse()).transpose().map_err(|_| {
            Error::Config(format!("line {}: invalid 'taskinq'", lineno + 1))
        })?,
        taskoutq_idx: kv(rest, "taskoutq").map(|v| v.parse()).transpose().map_err(|_| {
            Error::Config(format!("line {}: invalid 'taskoutq'", lineno + 1))
        })?,
    })
}

fn parse_coproc_thread(rest: &[&str], lineno: usize) -> Result<CoprocThreadConf> {
    Ok(CoprocThreadConf {
        core_id: kv_usize(rest, "core", lineno)?,
        device_id: kv_usize(rest, "device", lineno)?,
        taskinq_idx: kv_usize(rest, "taskinq", lineno)?,
    })
}

/// One element instance in the pipeline IR.
#[derive(Debug, Clone)]
pub struct ElementDecl {
    /// Dense instance id.
    pub id: usize,
    /// Element class name.
    pub class: String,
    /// Configuration tokens passed to `configure`.
    pub args: Vec<String>,
}

/// One port connection in the pipeline IR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeDecl {
    /// Source element id.
    pub src: usize,
    /// Source output port.
    pub src_port: usize,
    /// Destination element id.
    pub dst: usize,
    /// Destination input port.
    pub dst_port: usize,
}

/// Parsed pipeline description.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    /// Element instances, indexed by id.
    pub elements: Vec<ElementDecl>,
    /// Port connections.
    pub edges: Vec<EdgeDecl>,
}

impl PipelineConfig {
    /// Parse the Click-flavored chain syntax.
    ///
    /// Statements are separated by `;` or newlines. A statement is either a
    /// declaration `name :: Class(args)` or a chain
    /// `A(args) [p] -> [q] b -> C`. Capitalized tokens instantiate a class
    /// anonymously; lowercase tokens refer to declared names.
    pub fn parse(text: &str) -> Result<Self> {
        let mut cfg = PipelineConfig::default();
        let mut names: HashMap<String, usize> = HashMap::new();

        let cleaned: String = text
            .lines()
            .map(|l| l.split('#').next().unwrap_or(""))
            .collect::<Vec<_>>()
            .join("\n");

        for stmt in cleaned.split([';', '\n']) {
            let stmt = stmt.trim();
            if stmt.is_empty() {
                continue;
            }
            if let Some((name, class_spec)) = stmt.split_once("::") {
                let name = name.trim();
                if name.is_empty() || !name.chars().next().unwrap().is_lowercase() {
                    return Err(Error::Config(format!(
                        "instance name '{}' must start lowercase",
                        name
                    )));
                }
                let (class, args) = parse_class_spec(class_spec.trim())?;
                let id = cfg.elements.len();
                cfg.elements.push(ElementDecl { id, class, args });
                if names.insert(name.to_string(), id).is_some() {
                    return Err(Error::Config(format!("duplicate instance name '{}'", name)));
                }
            } else if stmt.contains("->") {
                let mut prev: Option<(usize, usize)> = None;
                for hop in stmt.split("->") {
                    let (in_port, ref_spec, out_port) = parse_endpoint(hop.trim())?;
                    let id = resolve_ref(&ref_spec, &mut cfg, &names)?;
                    if let Some((src, src_port)) = prev {
                        cfg.edges.push(EdgeDecl {
                            src,
                            src_port,
                            dst: id,
                            dst_port: in_port,
                        });
                    }
                    prev = Some((id, out_port));
                }
            } else {
                // A bare element statement instantiates without wiring.
                let (in_port, ref_spec, _out) = parse_endpoint(stmt)?;
                if in_port != 0 {
                    return Err(Error::Config(format!("stray port on '{}'", stmt)));
                }
                resolve_ref(&ref_spec, &mut cfg, &names)?;
            }
        }
        if cfg.elements.is_empty() {
            return Err(Error::Config("pipeline declares no elements".into()));
        }
        Ok(cfg)
    }
}

fn parse_class_spec(spec: &str) -> Result<(String, Vec<String>)> {
    let spec = spec.trim();
    if let Some(open) = spec.find('(') {
        let close = spec
            .rfind(')')
            .ok_or_else(|| Error::Config(format!("unbalanced parens in '{}'", spec)))?;
        let class = spec[..open].trim().to_string();
        let args = spec[open + 1..close]
            .split([',', ' '])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        Ok((class, args))
    } else {
        Ok((spec.to_string(), Vec::new()))
    }
}

/// Split `[p] Ref(args) [q]` into (input port, ref spec, output port).
fn parse_endpoint(hop: &str) -> Result<(usize, String, usize)> {
    let mut rest = hop.trim();
    let mut in_port = 0;
    let mut out_port = 0;
    if let Some(stripped) = rest.strip_prefix('[') {
        let close = stripped
            .find(']')
            .ok_or_else(|| Error::Config(format!("unbalanced bracket in '{}'", hop)))?;
        in_port = stripped[..close]
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("invalid input port in '{}'", hop)))?;
        rest = stripped[close + 1..].trim();
    }
    if let Some(open) = rest.rfind('[') {
        // A trailing bracket after the ref is the output port; brackets
        // inside parens belong to args and are not supported.
        if rest.ends_with(']') && open > 0 {
            out_port = rest[open + 1..rest.len() - 1]
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("invalid output port in '{}'", hop)))?;
            rest = rest[..open].trim();
        }
    }
    if rest.is_empty() {
        return Err(Error::Config(format!("empty element reference in '{}'", hop)));
    }
    Ok((in_port, rest.to_string(), out_port))
}

fn resolve_ref(
    spec: &str,
    cfg: &mut PipelineConfig,
    names: &HashMap<String, usize>,
) -> Result<usize> {
    let first = spec.chars().next().unwrap();
    if first.is_uppercase() {
        let (class, args) = parse_class_spec(spec)?;
        let id = cfg.elements.len();
        cfg.elements.push(ElementDecl { id, class, args });
        Ok(id)
    } else {
        names
            .get(spec)
            .copied()
            .ok_or_else(|| Error::Config(format!("unknown instance '{}'", spec)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_defaults() {
        let cfg = SystemConfig::default();
        assert_eq!(cfg.param("COMP_BATCH_SIZE"), 32);
        assert_eq!(cfg.param("COPROC_PPDEPTH"), 32);
    }

    #[test]
    fn test_parse_system_config() {
        let text = "\
# test layout
COMP_BATCH_SIZE 64
IO_BATCH_SIZE 16
queue swrx node 0
io_thread core 0 rxq 0:0 swrxq 0
comp_thread core 1 swrxq 0
";
        let cfg = SystemConfig::parse(text).unwrap();
        assert_eq!(cfg.param("COMP_BATCH_SIZE"), 64);
        assert_eq!(cfg.io_threads.len(), 1);
        assert_eq!(cfg.io_threads[0].attached_rxqs, vec![(0, 0)]);
        assert_eq!(cfg.comp_threads[0].swrxq_idx, 0);
    }

    #[test]
    fn test_unrecognized_key_rejected() {
        assert!(SystemConfig::parse("BOGUS_KEY 1\n").is_err());
    }

    #[test]
    fn test_write_params_roundtrip() {
        let text = "TASKPOOL_SIZE 128\nCOMP_BATCH_SIZE 64\nqueue swrx node 0\nio_thread core 0 rxq 0:0 swrxq 0\ncomp_thread core 1 swrxq 0\n";
        let cfg = SystemConfig::parse(text).unwrap();
        let first = cfg.write_params();
        // Canonical order puts COMP_BATCH_SIZE before TASKPOOL_SIZE.
        assert!(first.find("COMP_BATCH_SIZE").unwrap() < first.find("TASKPOOL_SIZE").unwrap());
        let reparsed = SystemConfig::parse(&format!(
            "{}queue swrx node 0\nio_thread core 0 rxq 0:0 swrxq 0\ncomp_thread core 1 swrxq 0\n",
            first
        ))
        .unwrap();
        assert_eq!(first, reparsed.write_params());
    }

    #[test]
    fn test_validate_queue_roles() {
        let text = "queue taskin node 0\nio_thread core 0 rxq 0:0 swrxq 0\ncomp_thread core 1 swrxq 0\n";
        assert!(SystemConfig::parse(text).is_err());
    }

    #[test]
    fn test_single_node_layout() {
        let cfg = SystemConfig::single_node(2, 1, true);
        cfg.validate().unwrap();
        assert_eq!(cfg.io_threads.len(), 2);
        assert_eq!(cfg.comp_threads.len(), 2);
        assert_eq!(cfg.coproc_threads.len(), 1);
        assert!(cfg.comp_threads[0].taskinq_idx.is_some());
    }

    #[test]
    fn test_pipeline_chain() {
        let cfg = PipelineConfig::parse("FromDevice(0) -> L2ForwardCreate(1) -> ToDevice(1)").unwrap();
        assert_eq!(cfg.elements.len(), 3);
        assert_eq!(cfg.elements[1].class, "L2ForwardCreate");
        assert_eq!(cfg.elements[1].args, vec!["1"]);
        assert_eq!(cfg.edges.len(), 2);
        assert_eq!(
            cfg.edges[0],
            EdgeDecl {
                src: 0,
                src_port: 0,
                dst: 1,
                dst_port: 0
            }
        );
    }

    #[test]
    fn test_pipeline_named_instances() {
        let text = "\
ipsec :: IPsecAuthHMACSHA1(1024);
FromDevice(0) -> ipsec -> ToDevice(1);
";
        let cfg = PipelineConfig::parse(text).unwrap();
        assert_eq!(cfg.elements.len(), 3);
        assert_eq!(cfg.elements[0].class, "IPsecAuthHMACSHA1");
        // The chain references the declared instance, not a new one.
        assert_eq!(cfg.edges[0].dst, 0);
    }

    #[test]
    fn test_pipeline_ports() {
        let cfg = PipelineConfig::parse("cls :: Classifier; cls[1] -> Discard; cls[0] -> ToDevice(0)")
            .unwrap();
        assert_eq!(cfg.edges[0].src_port, 1);
        assert_eq!(cfg.edges[1].src_port, 0);
    }

    #[test]
    fn test_pipeline_unknown_ref() {
        assert!(PipelineConfig::parse("FromDevice(0) -> nosuch").is_err());
    }

    #[test]
    fn test_empty_pipeline_rejected() {
        assert!(PipelineConfig::parse("# nothing\n").is_err());
    }
}
