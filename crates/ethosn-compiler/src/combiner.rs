//! Section search: one plan per part, glues between sections.
//!
//! Parts are visited in id (topological) order. At each part the search
//! either places it alone, or starts a section and extends it through the
//! SISO chain with compatible plans. Search state memoises on the frontier —
//! the part index where a fresh section starts — and plans are generated
//! lazily through a cache so infeasible subtrees never materialise plans.

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use ethosn_chip::{BlockConfig, HardwareCapabilities};

use crate::error::{CompileError, Result};
use crate::geometry::is_compression_format_compatible_with_stripe_shape;
use crate::parts::{
    CascadeType, GraphOfParts, Part, PartId, PartInputSlot, PlanContext,
};
use crate::plan::{Buffer, BufferFormat, BufferType, Glue, Location, Plan};
use crate::tensor::{total_size_bytes_nhwcb, TensorShape};
use crate::weights::WeightEncoderCache;

/// Cost of a combination, compared lexicographically as
/// `(total, non_parallel, passes)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Metric {
    /// DRAM traffic that cannot overlap compute (network inputs/outputs).
    pub non_parallel_dram_bytes: u64,
    /// DRAM traffic that can overlap compute (intermediates, weights).
    pub parallel_dram_bytes: u64,
    /// Number of sections.
    pub passes: u64,
}

impl Metric {
    /// The headline cost.
    pub const fn total(&self) -> u64 {
        self.non_parallel_dram_bytes + self.parallel_dram_bytes + self.passes
    }

    fn add(&mut self, other: Metric) {
        self.non_parallel_dram_bytes += other.non_parallel_dram_bytes;
        self.parallel_dram_bytes += other.parallel_dram_bytes;
        self.passes += other.passes;
    }
}

impl PartialOrd for Metric {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Metric {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.total(), self.non_parallel_dram_bytes, self.passes).cmp(&(
            other.total(),
            other.non_parallel_dram_bytes,
            other.passes,
        ))
    }
}

/// One part's assignment in a combination.
#[derive(Debug, Clone)]
pub struct Elem {
    /// The chosen plan.
    pub plan: Rc<Plan>,
    /// True when this part consumes its producer's output buffer directly
    /// (it is the Middle/End of a section).
    pub continues_section: bool,
    /// Glue per input slot, filled by [`Combiner::finalise`].
    pub glues: BTreeMap<PartInputSlot, Glue>,
}

/// The final artefact of the section search.
#[derive(Debug, Clone, Default)]
pub struct Combination {
    /// Assignment per part.
    pub elems: BTreeMap<PartId, Elem>,
    /// Cost. Exact after [`Combiner::finalise`].
    pub metric: Metric,
}

impl Combination {
    fn merge(mut self, other: Combination) -> Combination {
        self.elems.extend(other.elems);
        self.metric.add(other.metric);
        self
    }
}

type PlanCacheKey = (
    PartId,
    CascadeType,
    Option<BlockConfig>,
    Option<(TensorShape, u32)>,
    u32,
);

/// Bound on plans explored per section step; candidates are SRAM-smallest
/// first, which keeps deep chains tractable.
const MAX_PLANS_PER_STEP: usize = 24;

/// The section-search driver.
pub struct Combiner<'a> {
    graph: &'a GraphOfParts,
    caps: &'a HardwareCapabilities,
    estimation: bool,
    weight_cache: &'a mut WeightEncoderCache,
    plan_cache: HashMap<PlanCacheKey, Rc<Vec<Rc<Plan>>>>,
    memo: HashMap<usize, Combination>,
}

impl<'a> Combiner<'a> {
    /// Create a combiner over a frozen graph.
    pub fn new(
        graph: &'a GraphOfParts,
        caps: &'a HardwareCapabilities,
        estimation: bool,
        weight_cache: &'a mut WeightEncoderCache,
    ) -> Self {
        Self {
            graph,
            caps,
            estimation,
            weight_cache,
            plan_cache: HashMap::new(),
            memo: HashMap::new(),
        }
    }

    /// Run the search and return the best combination with glues attached.
    ///
    /// # Errors
    ///
    /// [`CompileError::SramOverflow`] when some part has no feasible plan;
    /// plan-generation errors propagate.
    pub fn run(&mut self) -> Result<Combination> {
        let combination = self.search(0)?;
        let mut combination = self.finalise(combination)?;
        // Every part appears exactly once.
        if combination.elems.len() != self.graph.num_parts() {
            return Err(CompileError::Internal("combination does not cover the graph"));
        }
        combination.metric.passes = combination
            .elems
            .values()
            .filter(|e| !e.continues_section)
            .count() as u64;
        tracing::debug!(
            "Combination found: {} section(s), {} DRAM bytes",
            combination.metric.passes,
            combination.metric.non_parallel_dram_bytes + combination.metric.parallel_dram_bytes
        );
        Ok(combination)
    }

    /// Plans for one part/position, through the cache.
    fn plans(
        &mut self,
        part: &Part,
        cascade: CascadeType,
        block_config: Option<BlockConfig>,
        prev_buffer: Option<&Buffer>,
        num_weight_stripes: u32,
    ) -> Result<Rc<Vec<Rc<Plan>>>> {
        let key: PlanCacheKey = (
            part.id(),
            cascade,
            block_config,
            prev_buffer.map(|b| (b.stripe_shape, b.num_stripes)),
            num_weight_stripes,
        );
        if let Some(hit) = self.plan_cache.get(&key) {
            return Ok(hit.clone());
        }

        let mut ctx = PlanContext {
            caps: self.caps,
            weight_cache: self.weight_cache,
            estimation: self.estimation,
        };
        let mut plans = part.get_plans(
            cascade,
            block_config,
            prev_buffer,
            num_weight_stripes,
            &mut ctx,
        )?;
        plans.sort_by_key(Plan::sram_bytes);
        plans.truncate(MAX_PLANS_PER_STEP);

        let plans = Rc::new(plans.into_iter().map(Rc::new).collect::<Vec<_>>());
        self.plan_cache.insert(key, plans.clone());
        Ok(plans)
    }

    /// True when the part at `index` chains into the part at `index + 1`
    /// as a single-input single-output pair.
    fn chainable(&self, index: usize) -> bool {
        let Some(part) = self.graph.part(PartId(index as u32)) else {
            return false;
        };
        let Some(next) = self.graph.part(PartId(index as u32 + 1)) else {
            return false;
        };
        if next.num_input_slots() != 1 || part.num_output_slots() != 1 {
            return false;
        }
        if !matches!(next, Part::Mce(_) | Part::FusedPle(_) | Part::StandalonePle(_)) {
            return false;
        }
        self.graph.single_consumer(part.id()) == Some(next.id())
    }

    /// Best combination covering parts `index..`, assuming a section boundary
    /// right before `index`.
    fn search(&mut self, index: usize) -> Result<Combination> {
        if index >= self.graph.num_parts() {
            return Ok(Combination::default());
        }
        if let Some(hit) = self.memo.get(&index) {
            return Ok(hit.clone());
        }

        let part_id = PartId(index as u32);
        let part = self
            .graph
            .part(part_id)
            .ok_or(CompileError::Internal("search ran off the part table"))?;

        if let Part::EstimateOnly(p) = part {
            if !self.estimation {
                return Err(CompileError::NotSupported(p.reason.clone()));
            }
        }

        let mut best: Option<Combination> = None;

        // Alone in its own section.
        let lonely_plans = self.plans(part, CascadeType::Lonely, None, None, 1)?;
        for plan in lonely_plans.iter() {
            let rest = self.search(index + 1)?;
            let mut combination = Combination::default();
            combination.metric.add(self.estimate_cost(part_id, plan, false));
            combination.elems.insert(
                part_id,
                Elem {
                    plan: plan.clone(),
                    continues_section: false,
                    glues: BTreeMap::new(),
                },
            );
            let combination = combination.merge(rest);
            if best.as_ref().map_or(true, |b| combination.metric < b.metric) {
                best = Some(combination);
            }
        }

        // Or at the beginning of a section.
        if self.chainable(index) {
            for num_weight_stripes in [1u32, 2] {
                let beginning_plans = self.plans(
                    part,
                    CascadeType::Beginning,
                    None,
                    None,
                    num_weight_stripes,
                )?;
                for plan in beginning_plans.iter() {
                    let Some(out_buffer) = self.plan_output_buffer(plan) else {
                        continue;
                    };
                    let block_config = plan_block_config(plan);
                    let mut acc = vec![(part_id, plan.clone())];
                    self.extend_section(
                        index + 1,
                        &mut acc,
                        block_config,
                        out_buffer,
                        num_weight_stripes,
                        &mut best,
                    )?;
                }
            }
        }

        let best = best.ok_or_else(|| CompileError::SramOverflow {
            part: part_id,
            need: 0,
            have: self.caps.total_sram_bytes,
        })?;
        self.memo.insert(index, best.clone());
        Ok(best)
    }

    /// Extend a section whose decided prefix is `acc`, trying the part at
    /// `index` as Middle (recurse) and as End (close and continue fresh).
    fn extend_section(
        &mut self,
        index: usize,
        acc: &mut Vec<(PartId, Rc<Plan>)>,
        block_config: Option<BlockConfig>,
        prev_buffer: Buffer,
        num_weight_stripes: u32,
        best: &mut Option<Combination>,
    ) -> Result<()> {
        let part_id = PartId(index as u32);
        let Some(part) = self.graph.part(part_id) else {
            return Ok(());
        };

        // Close the section here.
        let end_plans = self.plans(
            part,
            CascadeType::End,
            block_config,
            Some(&prev_buffer),
            num_weight_stripes,
        )?;
        for plan in end_plans.iter() {
            let rest = self.search(index + 1)?;
            let mut combination = Combination::default();
            for (i, (id, chain_plan)) in acc.iter().enumerate() {
                combination.metric.add(self.estimate_cost(*id, chain_plan, i > 0));
                combination.elems.insert(
                    *id,
                    Elem {
                        plan: chain_plan.clone(),
                        continues_section: i > 0,
                        glues: BTreeMap::new(),
                    },
                );
            }
            combination.metric.add(self.estimate_cost(part_id, plan, true));
            combination.elems.insert(
                part_id,
                Elem {
                    plan: plan.clone(),
                    continues_section: true,
                    glues: BTreeMap::new(),
                },
            );
            let combination = combination.merge(rest);
            if best.as_ref().map_or(true, |b| combination.metric < b.metric) {
                *best = Some(combination);
            }
        }

        // Or keep going through the chain.
        if self.chainable(index) {
            let middle_plans = self.plans(
                part,
                CascadeType::Middle,
                block_config,
                Some(&prev_buffer),
                num_weight_stripes,
            )?;
            for plan in middle_plans.iter() {
                let Some(out_buffer) = self.plan_output_buffer(plan) else {
                    continue;
                };
                acc.push((part_id, plan.clone()));
                self.extend_section(
                    index + 1,
                    acc,
                    block_config.or_else(|| plan_block_config(plan)),
                    out_buffer,
                    num_weight_stripes,
                    best,
                )?;
                acc.pop();
            }
        }

        Ok(())
    }

    /// The plan's single output buffer, cloned for chain filtering.
    fn plan_output_buffer(&self, plan: &Plan) -> Option<Buffer> {
        let (&buffer_id, _) = plan.output_mappings.iter().next()?;
        Some(plan.graph.buffer(buffer_id).clone())
    }

    /// Approximate DRAM cost of placing `plan` for `part_id`. Exact glue
    /// accounting happens in [`Self::finalise`]; the estimate only needs to
    /// rank plans, and tensor sizes dominate either way.
    fn estimate_cost(&self, part_id: PartId, plan: &Plan, continues_section: bool) -> Metric {
        let mut metric = Metric {
            passes: u64::from(!continues_section),
            ..Metric::default()
        };

        for (&buffer_id, slot) in &plan.input_mappings {
            if continues_section {
                continue;
            }
            let Some(source) = self.graph.get_connected_output_slot(*slot) else {
                continue;
            };
            let buffer = plan.graph.buffer(buffer_id);
            let bytes = u64::from(total_size_bytes_nhwcb(buffer.tensor_shape));

            let producer_in_dram = matches!(
                self.graph.part(source.part),
                Some(Part::Input(_) | Part::Reshape(_) | Part::Concat(_) | Part::EstimateOnly(_))
            );
            let consumer_in_dram = buffer.location == Location::Dram;

            let transfers = match (producer_in_dram, consumer_in_dram) {
                (true, true) => 0,
                (true, false) | (false, true) => 1,
                (false, false) => 2,
            };
            let non_parallel = matches!(self.graph.part(source.part), Some(Part::Input(_)))
                || matches!(self.graph.part(part_id), Some(Part::Output(_)));
            if non_parallel {
                metric.non_parallel_dram_bytes += bytes * transfers;
            } else {
                metric.parallel_dram_bytes += bytes * transfers;
            }
        }
        metric
    }

    /// Attach glues to every input slot that is not section-internal, and
    /// recompute the metric from the actual glue buffers.
    fn finalise(&self, mut combination: Combination) -> Result<Combination> {
        let mut metric = Metric::default();
        let mut glue_assignments: Vec<(PartId, PartInputSlot, Glue)> = Vec::new();

        for (&part_id, elem) in &combination.elems {
            for (&buffer_id, slot) in &elem.plan.input_mappings {
                if elem.continues_section {
                    continue;
                }
                let source = self
                    .graph
                    .get_connected_output_slot(*slot)
                    .ok_or(CompileError::Internal("combination input without source"))?;
                let producer_elem = combination
                    .elems
                    .get(&source.part)
                    .ok_or(CompileError::Internal("combination misses a producer"))?;
                let producer_buffer_id = producer_elem
                    .plan
                    .output_buffer(source)
                    .ok_or(CompileError::Internal("producer plan misses its output"))?;
                let producer_buffer = producer_elem.plan.graph.buffer(producer_buffer_id);
                let consumer_buffer = elem.plan.graph.buffer(buffer_id);

                let glue = self.make_glue(producer_buffer, consumer_buffer);
                let bytes = u64::from(
                    glue.dram_buffer
                        .as_ref()
                        .map_or_else(
                            || {
                                if glue.store {
                                    consumer_buffer.size_bytes
                                } else {
                                    producer_buffer.size_bytes
                                }
                            },
                            |b| b.size_bytes,
                        ),
                );
                let transfers = u64::from(glue.store) + u64::from(glue.load);
                let non_parallel = producer_buffer.buffer_type == Some(BufferType::Input)
                    || consumer_buffer.buffer_type == Some(BufferType::Output);
                if non_parallel {
                    metric.non_parallel_dram_bytes += bytes * transfers;
                } else {
                    metric.parallel_dram_bytes += bytes * transfers;
                }
                glue_assignments.push((part_id, *slot, glue));
            }
        }

        for (part_id, slot, glue) in glue_assignments {
            if let Some(elem) = combination.elems.get_mut(&part_id) {
                elem.glues.insert(slot, glue);
            }
        }
        combination.metric = metric;
        Ok(combination)
    }

    /// Build the glue between two boundary buffers, electing the DRAM format
    /// that compresses best while staying cell-compatible with both sides.
    fn make_glue(&self, producer: &Buffer, consumer: &Buffer) -> Glue {
        let producer_dram = producer.location == Location::Dram;
        let consumer_dram = consumer.location == Location::Dram;

        match (producer_dram, consumer_dram) {
            // DRAM to DRAM is an alias (reshape, concat into output).
            (true, true) => Glue {
                dram_buffer: None,
                store: false,
                load: false,
            },
            (true, false) => Glue {
                dram_buffer: None,
                store: false,
                load: true,
            },
            (false, true) => Glue {
                dram_buffer: None,
                store: true,
                load: false,
            },
            (false, false) => {
                let tensor = producer.tensor_shape;
                let mut format = BufferFormat::Nhwcb;
                for candidate in [BufferFormat::FcafDeep, BufferFormat::FcafWide] {
                    if candidate == BufferFormat::FcafWide
                        && (producer.forbid_fcaf_wide || consumer.forbid_fcaf_wide)
                    {
                        continue;
                    }
                    let compatible = is_compression_format_compatible_with_stripe_shape(
                        candidate,
                        producer.stripe_shape,
                        tensor,
                    ) && is_compression_format_compatible_with_stripe_shape(
                        candidate,
                        consumer.stripe_shape,
                        consumer.tensor_shape,
                    );
                    if compatible {
                        format = candidate;
                        break;
                    }
                }

                let mut buffer = Buffer::new_dram(format, tensor);
                buffer.buffer_type = Some(BufferType::Intermediate);
                buffer.data_type = producer.data_type;
                buffer.quant = producer.quant;
                Glue {
                    dram_buffer: Some(buffer),
                    store: true,
                    load: true,
                }
            }
        }
    }
}

/// Block config of a plan's MCE op, if it has one.
fn plan_block_config(plan: &Plan) -> Option<BlockConfig> {
    plan.graph.ops().iter().find_map(|op| match op {
        crate::plan::Op::Mce(mce) => Some(mce.block_config),
        _ => None,
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{ConvInfo, Network, NetworkToGraphOfParts, OperationKind, WeightLayout};
    use crate::tensor::{DataType, QuantizationInfo, TensorInfo, TensorShape};
    use crate::CompilationOptions;
    use bytes::Bytes;
    use ethosn_chip::EthosN78Variant;

    fn caps() -> HardwareCapabilities {
        HardwareCapabilities::from_variant(EthosN78Variant::Ethos78_4Tops_4PleRatio)
    }

    fn info(shape: TensorShape) -> TensorInfo {
        TensorInfo::new(shape, DataType::QAsymmU8, QuantizationInfo::new(0, 1.0))
    }

    fn conv_info(i: u32, o: u32) -> ConvInfo {
        ConvInfo {
            weights_shape: TensorShape::new(1, 1, i, o),
            layout: WeightLayout::Hwio,
            weights: Bytes::from(vec![1u8; (i * o) as usize]),
            weights_quant: QuantizationInfo::new(0, 0.1),
            bias: vec![0; o as usize],
            bias_quant: QuantizationInfo::new(0, 0.1),
            stride: (1, 1),
            pad: (0, 0),
        }
    }

    /// Input -> 1x1 conv -> Output.
    fn conv_graph() -> GraphOfParts {
        let shape = TensorShape::new(1, 16, 16, 16);
        let mut network = Network::new();
        let input = network.add(OperationKind::Input, vec![], info(shape));
        let conv = network.add(
            OperationKind::Convolution(conv_info(16, 16)),
            vec![input],
            info(shape),
        );
        network.add(OperationKind::Output, vec![conv], info(shape));
        let options = CompilationOptions::default();
        NetworkToGraphOfParts::new(&network, &options, false)
            .convert()
            .unwrap()
    }

    /// Two inputs -> Addition -> Output.
    fn addition_graph() -> GraphOfParts {
        let shape = TensorShape::new(1, 16, 16, 16);
        let mut network = Network::new();
        let a = network.add(OperationKind::Input, vec![], info(shape));
        let b = network.add(OperationKind::Input, vec![], info(shape));
        let sum = network.add(OperationKind::Addition, vec![a, b], info(shape));
        network.add(OperationKind::Output, vec![sum], info(shape));
        let options = CompilationOptions::default();
        NetworkToGraphOfParts::new(&network, &options, false)
            .convert()
            .unwrap()
    }

    #[test]
    fn test_metric_orders_by_total_first() {
        let cheap = Metric {
            non_parallel_dram_bytes: 10,
            parallel_dram_bytes: 10,
            passes: 5,
        };
        let expensive = Metric {
            non_parallel_dram_bytes: 100,
            parallel_dram_bytes: 0,
            passes: 1,
        };
        assert!(cheap < expensive);
    }

    #[test]
    fn test_metric_tie_breaks_on_non_parallel_then_passes() {
        // Equal totals: less non-parallel traffic wins.
        let a = Metric {
            non_parallel_dram_bytes: 0,
            parallel_dram_bytes: 10,
            passes: 0,
        };
        let b = Metric {
            non_parallel_dram_bytes: 10,
            parallel_dram_bytes: 0,
            passes: 0,
        };
        assert!(a < b);

        // Equal totals and non-parallel bytes: fewer passes win.
        let c = Metric {
            non_parallel_dram_bytes: 5,
            parallel_dram_bytes: 4,
            passes: 1,
        };
        let d = Metric {
            non_parallel_dram_bytes: 5,
            parallel_dram_bytes: 3,
            passes: 2,
        };
        assert!(c < d);
        assert_eq!(c.total(), d.total());
    }

    #[test]
    fn test_chainable_follows_siso_chains() {
        let graph = conv_graph();
        let hw = caps();
        let mut cache = WeightEncoderCache::new();
        let combiner = Combiner::new(&graph, &hw, false, &mut cache);

        // Input -> Mce is a single-consumer pair with an MCE successor.
        assert!(combiner.chainable(0));
        // Mce -> Output: output parts never sit inside a section.
        assert!(!combiner.chainable(1));
        // Past the end of the part table.
        assert!(!combiner.chainable(2));
    }

    #[test]
    fn test_chainable_rejects_multi_input_successors() {
        let graph = addition_graph();
        let hw = caps();
        let mut cache = WeightEncoderCache::new();
        let combiner = Combiner::new(&graph, &hw, false, &mut cache);

        // Neither input chains into the two-input addition part.
        assert!(!combiner.chainable(0));
        assert!(!combiner.chainable(1));
    }

    #[test]
    fn test_make_glue_elects_fcaf_deep_first() {
        let graph = GraphOfParts::new();
        let hw = caps();
        let mut cache = WeightEncoderCache::new();
        let combiner = Combiner::new(&graph, &hw, false, &mut cache);

        // Height-split stripes on deep-cell boundaries.
        let tensor = TensorShape::new(1, 64, 64, 64);
        let stripe = TensorShape::new(1, 8, 64, 64);
        let producer = Buffer::new_sram(tensor, stripe);
        let consumer = Buffer::new_sram(tensor, stripe);

        let glue = combiner.make_glue(&producer, &consumer);
        assert!(glue.store && glue.load);
        let dram = glue.dram_buffer.expect("SRAM-to-SRAM glue needs a buffer");
        assert_eq!(dram.format, BufferFormat::FcafDeep);
        assert_eq!(dram.buffer_type, Some(BufferType::Intermediate));
    }

    #[test]
    fn test_make_glue_falls_back_to_wide_then_nhwcb() {
        let graph = GraphOfParts::new();
        let hw = caps();
        let mut cache = WeightEncoderCache::new();
        let combiner = Combiner::new(&graph, &hw, false, &mut cache);

        // A 16-deep channel split is wide-cell aligned but not deep-cell
        // aligned.
        let tensor = TensorShape::new(1, 64, 64, 64);
        let stripe = TensorShape::new(1, 64, 64, 16);
        let mut producer = Buffer::new_sram(tensor, stripe);
        let consumer = Buffer::new_sram(tensor, stripe);

        let glue = combiner.make_glue(&producer, &consumer);
        assert_eq!(
            glue.dram_buffer.as_ref().map(|b| b.format),
            Some(BufferFormat::FcafWide)
        );

        // A tile laid out without wide-cell rounding forbids the wide form.
        producer.forbid_fcaf_wide = true;
        let glue = combiner.make_glue(&producer, &consumer);
        assert_eq!(
            glue.dram_buffer.as_ref().map(|b| b.format),
            Some(BufferFormat::Nhwcb)
        );
    }

    #[test]
    fn test_make_glue_dram_endpoints_need_no_buffer() {
        let graph = GraphOfParts::new();
        let hw = caps();
        let mut cache = WeightEncoderCache::new();
        let combiner = Combiner::new(&graph, &hw, false, &mut cache);

        let tensor = TensorShape::new(1, 16, 16, 16);
        let dram = Buffer::new_dram(BufferFormat::Nhwc, tensor);
        let sram = Buffer::new_sram(tensor, tensor);

        let load = combiner.make_glue(&dram, &sram);
        assert!(load.load && !load.store && load.dram_buffer.is_none());

        let store = combiner.make_glue(&sram, &dram);
        assert!(store.store && !store.load && store.dram_buffer.is_none());

        let alias = combiner.make_glue(&dram, &dram);
        assert!(!alias.store && !alias.load && alias.dram_buffer.is_none());
    }
}
