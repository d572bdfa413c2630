//! XML form of the command stream.
//!
//! Exists solely for tests and offline debugging; the binary form is what the
//! firmware consumes. The element vocabulary follows the firmware tooling
//! (`STREAM`, `CASCADE`, `AGENTS`, `DMA_RD_COMMANDS`, `DMA_WR_COMMANDS`,
//! `MCE_COMMANDS`, `PLE_COMMANDS`), with one typed leaf per field so that
//! `binary -> xml -> binary` is lossless.

use std::fmt::Write as _;

use ethosn_chip::{PleKernelId, Version};

use crate::agents::{
    Agent, AgentData, AgentDependencyInfo, BlockSize, Dependency, FilterShape, FmSData,
    FmsDataType, IfmDelta, IfmS, MceOperation, MceS, MceWorkSize, OfmS, Padding, PleIfmInfo,
    PleInputMode, PleL, PleS, Ratio, ReluActivation, StrideXy, SupertensorSize, TensorSize, Tile,
    WgtS, WgtWorkSize,
};
use crate::commands::{Command, CommandStream, CounterName};
use crate::error::{CommandStreamError, Result};

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

/// Render a stream as XML text.
pub fn write_xml(stream: &CommandStream) -> String {
    let mut w = XmlWriter::new();
    w.raw(r#"<?xml version="1.0" encoding="utf-8"?>"#);
    w.raw(&format!(
        r#"<STREAM VERSION_MAJOR="{}" VERSION_MINOR="{}" VERSION_PATCH="{}">"#,
        stream.version.major, stream.version.minor, stream.version.patch
    ));
    w.indent += 1;

    w.open("CASCADE");
    w.open("AGENTS");
    for (i, agent) in stream.agents.iter().enumerate() {
        w.comment(&format!("Agent {i}"));
        write_agent(&mut w, agent);
    }
    w.close("AGENTS");

    for (tag, queue) in [
        ("DMA_RD_COMMANDS", &stream.dma_rd_commands),
        ("DMA_WR_COMMANDS", &stream.dma_wr_commands),
        ("MCE_COMMANDS", &stream.mce_commands),
        ("PLE_COMMANDS", &stream.ple_commands),
    ] {
        w.open(tag);
        for cmd in queue {
            write_command(&mut w, cmd);
        }
        w.close(tag);
    }
    w.close("CASCADE");

    w.indent -= 1;
    w.raw("</STREAM>");
    w.out
}

struct XmlWriter {
    out: String,
    indent: usize,
}

impl XmlWriter {
    fn new() -> Self {
        Self {
            out: String::new(),
            indent: 0,
        }
    }

    fn raw(&mut self, text: &str) {
        for _ in 0..self.indent {
            self.out.push_str("    ");
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn comment(&mut self, text: &str) {
        self.raw(&format!("<!-- {text} -->"));
    }

    fn open(&mut self, tag: &str) {
        self.raw(&format!("<{tag}>"));
        self.indent += 1;
    }

    fn close(&mut self, tag: &str) {
        self.indent -= 1;
        self.raw(&format!("</{tag}>"));
    }

    fn leaf(&mut self, tag: &str, value: impl std::fmt::Display) {
        let mut line = String::new();
        let _ = write!(line, "<{tag}>{value}</{tag}>");
        self.raw(&line);
    }
}

fn write_tile(w: &mut XmlWriter, tag: &str, tile: &Tile) {
    w.open(tag);
    w.leaf("BASE_ADDR", tile.base_addr);
    w.leaf("NUM_SLOTS", tile.num_slots);
    w.leaf("SLOT_SIZE", tile.slot_size);
    w.close(tag);
}

fn write_tensor_size(w: &mut XmlWriter, tag: &str, ts: &TensorSize) {
    w.open(tag);
    w.leaf("HEIGHT", ts.height);
    w.leaf("WIDTH", ts.width);
    w.leaf("CHANNELS", ts.channels);
    w.close(tag);
}

fn write_mce_work(w: &mut XmlWriter, tag: &str, ws: &MceWorkSize) {
    w.open(tag);
    w.leaf("OFM_HEIGHT", ws.ofm_height);
    w.leaf("OFM_WIDTH", ws.ofm_width);
    w.leaf("OFM_CHANNELS", ws.ofm_channels);
    w.leaf("IFM_CHANNELS", ws.ifm_channels);
    w.close(tag);
}

fn write_wgt_work(w: &mut XmlWriter, tag: &str, ws: &WgtWorkSize) {
    w.open(tag);
    w.leaf("OFM_CHANNELS", ws.ofm_channels);
    w.leaf("IFM_CHANNELS", ws.ifm_channels);
    w.close(tag);
}

fn write_fm_data(w: &mut XmlWriter, fm: &FmSData) {
    w.leaf("DRAM_OFFSET", fm.dram_offset);
    w.leaf("BUFFER_ID", fm.buffer_id);
    w.leaf("DATA_TYPE", fm.data_type.name());
    write_tile(w, "TILE", &fm.tile);
    write_tensor_size(w, "DFLT_STRIPE_SIZE", &fm.dflt_stripe_size);
    write_tensor_size(w, "EDGE_STRIPE_SIZE", &fm.edge_stripe_size);
    w.open("SUPERTENSOR_SIZE_IN_CELLS");
    w.leaf("WIDTH", fm.supertensor_size_in_cells.width);
    w.leaf("CHANNELS", fm.supertensor_size_in_cells.channels);
    w.close("SUPERTENSOR_SIZE_IN_CELLS");
    write_tensor_size(w, "NUM_STRIPES", &fm.num_stripes);
    write_tensor_size(w, "STRIPE_ID_STRIDES", &fm.stripe_id_strides);
}

fn write_ple_ifm_info(w: &mut XmlWriter, tag: &str, info: &PleIfmInfo) {
    w.open(tag);
    w.leaf("ZERO_POINT", info.zero_point);
    w.leaf("MULTIPLIER", info.multiplier);
    w.leaf("SHIFT", info.shift);
    w.close(tag);
}

fn write_dependency(w: &mut XmlWriter, tag: &str, dep: &Dependency) {
    w.open(tag);
    w.leaf("RELATIVE_AGENT_ID", dep.relative_agent_id);
    w.leaf("OUTER_RATIO_OTHER", dep.outer_ratio.other);
    w.leaf("OUTER_RATIO_SELF", dep.outer_ratio.this);
    w.leaf("INNER_RATIO_OTHER", dep.inner_ratio.other);
    w.leaf("INNER_RATIO_SELF", dep.inner_ratio.this);
    w.leaf("BOUNDARY", dep.boundary);
    w.close(tag);
}

fn write_agent(w: &mut XmlWriter, agent: &Agent) {
    let tag = agent.data.kind_name();
    w.open(tag);
    match &agent.data {
        AgentData::IfmStreamer(ifm) => write_fm_data(w, &ifm.fm_data),
        AgentData::OfmStreamer(ofm) => write_fm_data(w, &ofm.fm_data),
        AgentData::WgtStreamer(wgt) => {
            w.leaf("BUFFER_ID", wgt.buffer_id);
            w.leaf("METADATA_BUFFER_ID", wgt.metadata_buffer_id);
            write_tile(w, "TILE", &wgt.tile);
            w.leaf("EDGE_STRIPE_OFM_CHANNELS", wgt.edge_stripe_ofm_channels);
            write_wgt_work(w, "NUM_STRIPES", &wgt.num_stripes);
            write_wgt_work(w, "STRIPE_ID_STRIDES", &wgt.stripe_id_strides);
        }
        AgentData::MceScheduler(mce) => {
            write_tile(w, "IFM_TILE", &mce.ifm_tile);
            write_tile(w, "WGT_TILE", &mce.wgt_tile);
            w.open("BLOCK_SIZE");
            w.leaf("WIDTH", mce.block_size.width);
            w.leaf("HEIGHT", mce.block_size.height);
            w.close("BLOCK_SIZE");
            write_mce_work(w, "DFLT_STRIPE_SIZE", &mce.dflt_stripe_size);
            write_mce_work(w, "EDGE_STRIPE_SIZE", &mce.edge_stripe_size);
            write_mce_work(w, "NUM_STRIPES", &mce.num_stripes);
            write_mce_work(w, "STRIPE_ID_STRIDES", &mce.stripe_id_strides);
            w.open("CONV_STRIDE_XY");
            w.leaf("X", mce.conv_stride_xy.x);
            w.leaf("Y", mce.conv_stride_xy.y);
            w.close("CONV_STRIDE_XY");
            w.leaf("IFM_ZERO_POINT", mce.ifm_zero_point);
            w.leaf("MCE_OP_MODE", mce.mce_op_mode.name());
            w.open("FILTER_SHAPE");
            w.leaf("WIDTH", mce.filter_shape.width);
            w.leaf("HEIGHT", mce.filter_shape.height);
            w.close("FILTER_SHAPE");
            w.open("PADDING");
            w.leaf("LEFT", mce.padding.left);
            w.leaf("TOP", mce.padding.top);
            w.close("PADDING");
            w.open("IFM_DELTA_DEFAULT");
            w.leaf("WIDTH", mce.ifm_delta_default.width);
            w.leaf("HEIGHT", mce.ifm_delta_default.height);
            w.close("IFM_DELTA_DEFAULT");
            w.open("IFM_DELTA_EDGE");
            w.leaf("WIDTH", mce.ifm_delta_edge.width);
            w.leaf("HEIGHT", mce.ifm_delta_edge.height);
            w.close("IFM_DELTA_EDGE");
            w.open("RELU_ACTIV");
            w.leaf("MIN", mce.relu_activ.min);
            w.leaf("MAX", mce.relu_activ.max);
            w.close("RELU_ACTIV");
            w.leaf("PLE_KERNEL_ID", mce.ple_kernel_id.tag());
        }
        AgentData::PleLoader(ple) => {
            w.leaf("PLE_KERNEL_ID", ple.ple_kernel_id.tag());
            w.leaf("SRAM_ADDR", ple.sram_addr);
        }
        AgentData::PleScheduler(ple) => {
            write_tile(w, "OFM_TILE", &ple.ofm_tile);
            w.leaf("OFM_ZERO_POINT", ple.ofm_zero_point);
            write_tensor_size(w, "DFLT_STRIPE_SIZE", &ple.dflt_stripe_size);
            write_tensor_size(w, "EDGE_STRIPE_SIZE", &ple.edge_stripe_size);
            write_tensor_size(w, "NUM_STRIPES", &ple.num_stripes);
            write_tensor_size(w, "STRIPE_ID_STRIDES", &ple.stripe_id_strides);
            w.leaf("INPUT_MODE", ple.input_mode.name());
            w.leaf("PLE_KERNEL_ID", ple.ple_kernel_id.tag());
            w.leaf("PLE_KERNEL_SRAM_ADDR", ple.ple_kernel_sram_addr);
            write_tile(w, "IFM_TILE0", &ple.ifm_tile0);
            write_ple_ifm_info(w, "IFM_INFO0", &ple.ifm_info0);
            write_tile(w, "IFM_TILE1", &ple.ifm_tile1);
            write_ple_ifm_info(w, "IFM_INFO1", &ple.ifm_info1);
        }
    }
    w.leaf("NUM_STRIPES_TOTAL", agent.info.num_stripes_total);
    write_dependency(w, "SCHEDULE_DEPENDENCY", &agent.info.schedule_dependencies[0]);
    write_dependency(w, "READ_DEPENDENCY0", &agent.info.read_dependencies[0]);
    write_dependency(w, "READ_DEPENDENCY1", &agent.info.read_dependencies[1]);
    write_dependency(w, "WRITE_DEPENDENCY", &agent.info.write_dependencies[0]);
    w.close(tag);
}

fn write_command(w: &mut XmlWriter, cmd: &Command) {
    let tag = cmd.kind_name();
    w.open(tag);
    match *cmd {
        Command::WaitForCounter { counter, target } => {
            w.leaf("COUNTER", counter.name());
            w.leaf("TARGET", target);
        }
        Command::ConfigMceif { agent_id } | Command::LoadPleCodeIntoPleSram { agent_id } => {
            w.leaf("AGENT_ID", agent_id);
        }
        Command::LoadIfmStripe {
            agent_id,
            stripe_id,
        }
        | Command::LoadWgtStripe {
            agent_id,
            stripe_id,
        }
        | Command::StoreOfmStripe {
            agent_id,
            stripe_id,
        }
        | Command::ProgramMceStripe {
            agent_id,
            stripe_id,
        }
        | Command::StartMceStripe {
            agent_id,
            stripe_id,
        }
        | Command::StartPleStripe {
            agent_id,
            stripe_id,
        } => {
            w.leaf("AGENT_ID", agent_id);
            w.leaf("STRIPE_ID", stripe_id);
        }
    }
    w.close(tag);
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// One parsed XML element: leaves carry text, interior nodes carry children.
#[derive(Debug)]
struct Node {
    name: String,
    text: String,
    children: Vec<Node>,
}

impl Node {
    fn child(&self, name: &str) -> Result<&Node> {
        self.children
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| CommandStreamError::malformed(format!("missing element <{name}>")))
    }

    fn leaf_text(&self, name: &str) -> Result<&str> {
        Ok(self.child(name)?.text.trim())
    }

    fn leaf<T: std::str::FromStr>(&self, name: &str) -> Result<T> {
        let text = self.leaf_text(name)?;
        text.parse().map_err(|_| {
            CommandStreamError::malformed(format!("bad value '{text}' in <{name}>"))
        })
    }
}

/// Parse the line-regular XML produced by [`write_xml`].
fn parse_tree(text: &str) -> Result<Node> {
    let mut root = Node {
        name: String::new(),
        text: String::new(),
        children: Vec::new(),
    };
    let mut stack: Vec<Node> = vec![];

    for (line_no, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        let err = |reason: &str| CommandStreamError::MalformedXml {
            line: line_no + 1,
            reason: reason.to_string(),
        };

        if line.is_empty() || line.starts_with("<?") || line.starts_with("<!--") {
            continue;
        }

        if let Some(rest) = line.strip_prefix("</") {
            // Closing tag
            let name = rest.strip_suffix('>').ok_or_else(|| err("unterminated tag"))?;
            let node = stack.pop().ok_or_else(|| err("unmatched closing tag"))?;
            if node.name != name {
                return Err(err(&format!(
                    "closing </{}> does not match <{}>",
                    name, node.name
                )));
            }
            match stack.last_mut() {
                Some(parent) => parent.children.push(node),
                None => root.children.push(node),
            }
        } else if line.starts_with('<') {
            let inner = &line[1..];
            if let Some(gt) = inner.find('>') {
                let (head, rest) = inner.split_at(gt);
                let rest = &rest[1..];
                // Attributes only appear on STREAM; keep them as pseudo-leaves.
                let (name, attrs) = match head.find(' ') {
                    Some(sp) => head.split_at(sp),
                    None => (head, ""),
                };
                let mut node = Node {
                    name: name.to_string(),
                    text: String::new(),
                    children: Vec::new(),
                };
                for attr in attrs.split_whitespace() {
                    if let Some((key, value)) = attr.split_once('=') {
                        node.children.push(Node {
                            name: key.to_string(),
                            text: value.trim_matches('"').to_string(),
                            children: Vec::new(),
                        });
                    }
                }
                if rest.is_empty() {
                    stack.push(node);
                } else if let Some(value) = rest.strip_suffix(&format!("</{name}>")) {
                    node.text = value.to_string();
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(node),
                        None => root.children.push(node),
                    }
                } else {
                    return Err(err("leaf value without matching closing tag"));
                }
            } else {
                return Err(err("unterminated tag"));
            }
        } else {
            return Err(err("expected a tag"));
        }
    }

    if !stack.is_empty() {
        return Err(CommandStreamError::malformed("unclosed elements at end of XML"));
    }
    Ok(root)
}

/// Parse the XML form back into a stream.
///
/// # Errors
///
/// Returns an error on structural problems, unknown element names, or
/// unparseable leaf values.
pub fn read_xml(text: &str) -> Result<CommandStream> {
    let root = parse_tree(text)?;
    let stream_node = root.child("STREAM")?;
    let version = Version::new(
        stream_node.leaf("VERSION_MAJOR")?,
        stream_node.leaf("VERSION_MINOR")?,
        stream_node.leaf("VERSION_PATCH")?,
    );
    let mut stream = CommandStream::new(version);

    let cascade = stream_node.child("CASCADE")?;
    for agent_node in &cascade.child("AGENTS")?.children {
        stream.agents.push(parse_agent(agent_node)?);
    }
    for (tag, queue) in [
        ("DMA_RD_COMMANDS", &mut stream.dma_rd_commands),
        ("DMA_WR_COMMANDS", &mut stream.dma_wr_commands),
        ("MCE_COMMANDS", &mut stream.mce_commands),
        ("PLE_COMMANDS", &mut stream.ple_commands),
    ] {
        for cmd_node in &cascade.child(tag)?.children {
            queue.push(parse_command(cmd_node)?);
        }
    }
    Ok(stream)
}

fn parse_tile(node: &Node, tag: &str) -> Result<Tile> {
    let t = node.child(tag)?;
    Ok(Tile {
        base_addr: t.leaf("BASE_ADDR")?,
        num_slots: t.leaf("NUM_SLOTS")?,
        slot_size: t.leaf("SLOT_SIZE")?,
    })
}

fn parse_tensor_size(node: &Node, tag: &str) -> Result<TensorSize> {
    let t = node.child(tag)?;
    Ok(TensorSize {
        height: t.leaf("HEIGHT")?,
        width: t.leaf("WIDTH")?,
        channels: t.leaf("CHANNELS")?,
    })
}

fn parse_mce_work(node: &Node, tag: &str) -> Result<MceWorkSize> {
    let t = node.child(tag)?;
    Ok(MceWorkSize {
        ofm_height: t.leaf("OFM_HEIGHT")?,
        ofm_width: t.leaf("OFM_WIDTH")?,
        ofm_channels: t.leaf("OFM_CHANNELS")?,
        ifm_channels: t.leaf("IFM_CHANNELS")?,
    })
}

fn parse_wgt_work(node: &Node, tag: &str) -> Result<WgtWorkSize> {
    let t = node.child(tag)?;
    Ok(WgtWorkSize {
        ofm_channels: t.leaf("OFM_CHANNELS")?,
        ifm_channels: t.leaf("IFM_CHANNELS")?,
    })
}

fn parse_fm_data(node: &Node) -> Result<FmSData> {
    let ty_name = node.leaf_text("DATA_TYPE")?;
    let data_type = [
        FmsDataType::Nhwc,
        FmsDataType::Nchw,
        FmsDataType::Nhwcb,
        FmsDataType::FcafDeep,
        FmsDataType::FcafWide,
    ]
    .into_iter()
    .find(|t| t.name() == ty_name)
    .ok_or_else(|| CommandStreamError::malformed(format!("bad DATA_TYPE '{ty_name}'")))?;

    let cells = node.child("SUPERTENSOR_SIZE_IN_CELLS")?;
    Ok(FmSData {
        dram_offset: node.leaf("DRAM_OFFSET")?,
        buffer_id: node.leaf("BUFFER_ID")?,
        data_type,
        tile: parse_tile(node, "TILE")?,
        dflt_stripe_size: parse_tensor_size(node, "DFLT_STRIPE_SIZE")?,
        edge_stripe_size: parse_tensor_size(node, "EDGE_STRIPE_SIZE")?,
        supertensor_size_in_cells: SupertensorSize {
            width: cells.leaf("WIDTH")?,
            channels: cells.leaf("CHANNELS")?,
        },
        num_stripes: parse_tensor_size(node, "NUM_STRIPES")?,
        stripe_id_strides: parse_tensor_size(node, "STRIPE_ID_STRIDES")?,
    })
}

fn parse_ple_kernel(node: &Node) -> Result<PleKernelId> {
    let tag = node.leaf_text("PLE_KERNEL_ID")?;
    PleKernelId::from_tag(tag)
        .ok_or_else(|| CommandStreamError::malformed(format!("unknown PLE kernel '{tag}'")))
}

fn parse_ple_ifm_info(node: &Node, tag: &str) -> Result<PleIfmInfo> {
    let t = node.child(tag)?;
    Ok(PleIfmInfo {
        zero_point: t.leaf("ZERO_POINT")?,
        multiplier: t.leaf("MULTIPLIER")?,
        shift: t.leaf("SHIFT")?,
    })
}

fn parse_dependency(node: &Node, tag: &str) -> Result<Dependency> {
    let t = node.child(tag)?;
    Ok(Dependency {
        relative_agent_id: t.leaf("RELATIVE_AGENT_ID")?,
        outer_ratio: Ratio {
            other: t.leaf("OUTER_RATIO_OTHER")?,
            this: t.leaf("OUTER_RATIO_SELF")?,
        },
        inner_ratio: Ratio {
            other: t.leaf("INNER_RATIO_OTHER")?,
            this: t.leaf("INNER_RATIO_SELF")?,
        },
        boundary: t.leaf("BOUNDARY")?,
    })
}

fn parse_agent(node: &Node) -> Result<Agent> {
    let data = match node.name.as_str() {
        "IFM_STREAMER" => AgentData::IfmStreamer(IfmS {
            fm_data: parse_fm_data(node)?,
        }),
        "OFM_STREAMER" => AgentData::OfmStreamer(OfmS {
            fm_data: parse_fm_data(node)?,
        }),
        "WGT_STREAMER" => AgentData::WgtStreamer(WgtS {
            buffer_id: node.leaf("BUFFER_ID")?,
            metadata_buffer_id: node.leaf("METADATA_BUFFER_ID")?,
            tile: parse_tile(node, "TILE")?,
            edge_stripe_ofm_channels: node.leaf("EDGE_STRIPE_OFM_CHANNELS")?,
            num_stripes: parse_wgt_work(node, "NUM_STRIPES")?,
            stripe_id_strides: parse_wgt_work(node, "STRIPE_ID_STRIDES")?,
        }),
        "MCE_SCHEDULER" => {
            let block = node.child("BLOCK_SIZE")?;
            let stride = node.child("CONV_STRIDE_XY")?;
            let filter = node.child("FILTER_SHAPE")?;
            let padding = node.child("PADDING")?;
            let delta_dflt = node.child("IFM_DELTA_DEFAULT")?;
            let delta_edge = node.child("IFM_DELTA_EDGE")?;
            let relu = node.child("RELU_ACTIV")?;
            let op_name = node.leaf_text("MCE_OP_MODE")?;
            let mce_op_mode = [
                MceOperation::Convolution,
                MceOperation::DepthwiseConvolution,
                MceOperation::FullyConnected,
            ]
            .into_iter()
            .find(|m| m.name() == op_name)
            .ok_or_else(|| {
                CommandStreamError::malformed(format!("bad MCE_OP_MODE '{op_name}'"))
            })?;

            AgentData::MceScheduler(MceS {
                ifm_tile: parse_tile(node, "IFM_TILE")?,
                wgt_tile: parse_tile(node, "WGT_TILE")?,
                block_size: BlockSize {
                    width: block.leaf("WIDTH")?,
                    height: block.leaf("HEIGHT")?,
                },
                dflt_stripe_size: parse_mce_work(node, "DFLT_STRIPE_SIZE")?,
                edge_stripe_size: parse_mce_work(node, "EDGE_STRIPE_SIZE")?,
                num_stripes: parse_mce_work(node, "NUM_STRIPES")?,
                stripe_id_strides: parse_mce_work(node, "STRIPE_ID_STRIDES")?,
                conv_stride_xy: StrideXy {
                    x: stride.leaf("X")?,
                    y: stride.leaf("Y")?,
                },
                ifm_zero_point: node.leaf("IFM_ZERO_POINT")?,
                mce_op_mode,
                filter_shape: FilterShape {
                    width: filter.leaf("WIDTH")?,
                    height: filter.leaf("HEIGHT")?,
                },
                padding: Padding {
                    left: padding.leaf("LEFT")?,
                    top: padding.leaf("TOP")?,
                },
                ifm_delta_default: IfmDelta {
                    width: delta_dflt.leaf("WIDTH")?,
                    height: delta_dflt.leaf("HEIGHT")?,
                },
                ifm_delta_edge: IfmDelta {
                    width: delta_edge.leaf("WIDTH")?,
                    height: delta_edge.leaf("HEIGHT")?,
                },
                relu_activ: ReluActivation {
                    min: relu.leaf("MIN")?,
                    max: relu.leaf("MAX")?,
                },
                ple_kernel_id: parse_ple_kernel(node)?,
            })
        }
        "PLE_LOADER" => AgentData::PleLoader(PleL {
            ple_kernel_id: parse_ple_kernel(node)?,
            sram_addr: node.leaf("SRAM_ADDR")?,
        }),
        "PLE_SCHEDULER" => {
            let mode_name = node.leaf_text("INPUT_MODE")?;
            let input_mode = [
                PleInputMode::MceAllOgs,
                PleInputMode::MceOneOg,
                PleInputMode::Sram,
            ]
            .into_iter()
            .find(|m| m.name() == mode_name)
            .ok_or_else(|| {
                CommandStreamError::malformed(format!("bad INPUT_MODE '{mode_name}'"))
            })?;

            AgentData::PleScheduler(PleS {
                ofm_tile: parse_tile(node, "OFM_TILE")?,
                ofm_zero_point: node.leaf("OFM_ZERO_POINT")?,
                dflt_stripe_size: parse_tensor_size(node, "DFLT_STRIPE_SIZE")?,
                edge_stripe_size: parse_tensor_size(node, "EDGE_STRIPE_SIZE")?,
                num_stripes: parse_tensor_size(node, "NUM_STRIPES")?,
                stripe_id_strides: parse_tensor_size(node, "STRIPE_ID_STRIDES")?,
                input_mode,
                ple_kernel_id: parse_ple_kernel(node)?,
                ple_kernel_sram_addr: node.leaf("PLE_KERNEL_SRAM_ADDR")?,
                ifm_tile0: parse_tile(node, "IFM_TILE0")?,
                ifm_info0: parse_ple_ifm_info(node, "IFM_INFO0")?,
                ifm_tile1: parse_tile(node, "IFM_TILE1")?,
                ifm_info1: parse_ple_ifm_info(node, "IFM_INFO1")?,
            })
        }
        other => {
            return Err(CommandStreamError::malformed(format!(
                "unknown agent element <{other}>"
            )))
        }
    };

    let info = AgentDependencyInfo {
        num_stripes_total: node.leaf("NUM_STRIPES_TOTAL")?,
        schedule_dependencies: [parse_dependency(node, "SCHEDULE_DEPENDENCY")?],
        read_dependencies: [
            parse_dependency(node, "READ_DEPENDENCY0")?,
            parse_dependency(node, "READ_DEPENDENCY1")?,
        ],
        write_dependencies: [parse_dependency(node, "WRITE_DEPENDENCY")?],
    };

    Ok(Agent { data, info })
}

fn parse_command(node: &Node) -> Result<Command> {
    Ok(match node.name.as_str() {
        "WAIT_FOR_COUNTER_COMMAND" => {
            let counter_name = node.leaf_text("COUNTER")?;
            let counter = [
                CounterName::DmaRd,
                CounterName::DmaWr,
                CounterName::MceStripe,
                CounterName::PleStripe,
            ]
            .into_iter()
            .find(|c| c.name() == counter_name)
            .ok_or_else(|| {
                CommandStreamError::malformed(format!("bad COUNTER '{counter_name}'"))
            })?;
            Command::WaitForCounter {
                counter,
                target: node.leaf("TARGET")?,
            }
        }
        "LOAD_IFM_STRIPE_COMMAND" => Command::LoadIfmStripe {
            agent_id: node.leaf("AGENT_ID")?,
            stripe_id: node.leaf("STRIPE_ID")?,
        },
        "LOAD_WGT_STRIPE_COMMAND" => Command::LoadWgtStripe {
            agent_id: node.leaf("AGENT_ID")?,
            stripe_id: node.leaf("STRIPE_ID")?,
        },
        "STORE_OFM_STRIPE_COMMAND" => Command::StoreOfmStripe {
            agent_id: node.leaf("AGENT_ID")?,
            stripe_id: node.leaf("STRIPE_ID")?,
        },
        "PROGRAM_MCE_STRIPE_COMMAND" => Command::ProgramMceStripe {
            agent_id: node.leaf("AGENT_ID")?,
            stripe_id: node.leaf("STRIPE_ID")?,
        },
        "CONFIG_MCEIF_COMMAND" => Command::ConfigMceif {
            agent_id: node.leaf("AGENT_ID")?,
        },
        "START_MCE_STRIPE_COMMAND" => Command::StartMceStripe {
            agent_id: node.leaf("AGENT_ID")?,
            stripe_id: node.leaf("STRIPE_ID")?,
        },
        "LOAD_PLE_CODE_COMMAND" => Command::LoadPleCodeIntoPleSram {
            agent_id: node.leaf("AGENT_ID")?,
        },
        "START_PLE_STRIPE_COMMAND" => Command::StartPleStripe {
            agent_id: node.leaf("AGENT_ID")?,
            stripe_id: node.leaf("STRIPE_ID")?,
        },
        other => {
            return Err(CommandStreamError::malformed(format!(
                "unknown command element <{other}>"
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethosn_chip::version::COMMAND_STREAM_VERSION;

    #[test]
    fn test_empty_stream_xml_round_trip() {
        let stream = CommandStream::new(COMMAND_STREAM_VERSION);
        let xml = write_xml(&stream);
        let parsed = read_xml(&xml).unwrap();
        assert_eq!(parsed, stream);
    }

    #[test]
    fn test_version_attributes_survive() {
        // Minor/patch mismatches are tolerated by consumers; the XML form
        // must carry them through unchanged.
        let version = Version::new(COMMAND_STREAM_VERSION.major, 9, 7);
        let stream = CommandStream::new(version);
        let parsed = read_xml(&write_xml(&stream)).unwrap();
        assert_eq!(parsed.version, version);
    }

    #[test]
    fn test_commands_round_trip() {
        let mut stream = CommandStream::new(COMMAND_STREAM_VERSION);
        stream.mce_commands.push(Command::WaitForCounter {
            counter: CounterName::DmaRd,
            target: 12,
        });
        stream.mce_commands.push(Command::ConfigMceif { agent_id: 2 });
        stream.mce_commands.push(Command::StartMceStripe {
            agent_id: 2,
            stripe_id: 0,
        });
        let parsed = read_xml(&write_xml(&stream)).unwrap();
        assert_eq!(parsed, stream);
    }

    #[test]
    fn test_unknown_element_rejected() {
        let xml = "<STREAM VERSION_MAJOR=\"1\" VERSION_MINOR=\"0\" VERSION_PATCH=\"0\">\n\
                   <CASCADE>\n<AGENTS>\n<BOGUS>\n</BOGUS>\n</AGENTS>\n\
                   <DMA_RD_COMMANDS>\n</DMA_RD_COMMANDS>\n<DMA_WR_COMMANDS>\n</DMA_WR_COMMANDS>\n\
                   <MCE_COMMANDS>\n</MCE_COMMANDS>\n<PLE_COMMANDS>\n</PLE_COMMANDS>\n\
                   </CASCADE>\n</STREAM>";
        assert!(read_xml(xml).is_err());
    }
}
