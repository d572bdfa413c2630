//! The graph of parts: an immutable DAG once compilation begins.
//!
//! Each input slot is sourced by exactly one output slot; output slots fan
//! out to any number of inputs. Ids are assigned in topological order, and
//! `connect` only accepts forward edges, which keeps the graph acyclic by
//! construction.

use std::collections::BTreeMap;

use crate::error::{CompileError, Result};
use crate::parts::{Part, PartId, PartInputSlot, PartOutputSlot};

/// Immutable DAG of parts with slot connections.
#[derive(Debug, Default)]
pub struct GraphOfParts {
    parts: Vec<Part>,
    /// Each input slot's source.
    connections: BTreeMap<PartInputSlot, PartOutputSlot>,
}

impl GraphOfParts {
    /// An empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id to be assigned by [`Self::add_part`].
    pub fn next_part_id(&self) -> PartId {
        PartId(u32::try_from(self.parts.len()).unwrap_or(u32::MAX))
    }

    /// Add a part. Its id must equal [`Self::next_part_id`].
    ///
    /// # Errors
    ///
    /// Returns an internal error on an out-of-order id.
    pub fn add_part(&mut self, part: Part) -> Result<PartId> {
        let id = part.id();
        if id != self.next_part_id() {
            return Err(CompileError::Internal("part ids must be dense and in order"));
        }
        self.parts.push(part);
        Ok(id)
    }

    /// Connect `output` to `input`.
    ///
    /// # Errors
    ///
    /// Rejects slots of unknown parts, an already-sourced input, a backward
    /// edge, and shape mismatches.
    pub fn connect(&mut self, output: PartOutputSlot, input: PartInputSlot) -> Result<()> {
        let producer = self
            .part(output.part)
            .ok_or(CompileError::Internal("connect: unknown producer part"))?;
        let consumer = self
            .part(input.part)
            .ok_or(CompileError::Internal("connect: unknown consumer part"))?;

        if output.index >= producer.num_output_slots() {
            return Err(CompileError::Internal("connect: no such output slot"));
        }
        if input.index >= consumer.num_input_slots() {
            return Err(CompileError::Internal("connect: no such input slot"));
        }
        if self.connections.contains_key(&input) {
            return Err(CompileError::Internal("connect: input slot already sourced"));
        }
        if output.part >= input.part {
            return Err(CompileError::Internal("connect: edge must point forward"));
        }

        let out_shape = producer.output_info().map(|i| i.shape);
        let in_shape = consumer.input_info(input.index).map(|i| i.shape);
        if let (Some(a), Some(b)) = (out_shape, in_shape) {
            if a != b {
                return Err(CompileError::Internal("connect: slot shapes differ"));
            }
        }

        self.connections.insert(input, output);
        Ok(())
    }

    /// The output slot feeding `input`, if connected.
    pub fn get_connected_output_slot(&self, input: PartInputSlot) -> Option<PartOutputSlot> {
        self.connections.get(&input).copied()
    }

    /// Every input slot fed by `output`.
    pub fn get_connected_input_slots(&self, output: PartOutputSlot) -> Vec<PartInputSlot> {
        self.connections
            .iter()
            .filter(|(_, src)| **src == output)
            .map(|(dst, _)| *dst)
            .collect()
    }

    /// Number of parts.
    pub fn num_parts(&self) -> usize {
        self.parts.len()
    }

    /// A part by id.
    pub fn part(&self, id: PartId) -> Option<&Part> {
        self.parts.get(id.0 as usize)
    }

    /// Mutate a part in place. Only the converter uses this, before the
    /// graph is frozen.
    pub fn with_part_mut<R>(&mut self, id: PartId, f: impl FnOnce(&mut Part) -> R) -> Option<R> {
        self.parts.get_mut(id.0 as usize).map(f)
    }

    /// Iterate parts in id (topological) order.
    pub fn parts(&self) -> impl Iterator<Item = &Part> {
        self.parts.iter()
    }

    /// All connections as `(input, output)` pairs.
    pub fn connections(&self) -> impl Iterator<Item = (PartInputSlot, PartOutputSlot)> + '_ {
        self.connections.iter().map(|(i, o)| (*i, *o))
    }

    /// True if every input slot of every part is sourced.
    pub fn is_complete(&self) -> bool {
        self.parts.iter().all(|part| {
            (0..part.num_input_slots()).all(|index| {
                self.connections.contains_key(&PartInputSlot {
                    part: part.id(),
                    index,
                })
            })
        })
    }

    /// Single consumer part of `part`'s only output, when the fan-out is
    /// exactly one. This is the chain the section search walks.
    pub fn single_consumer(&self, part: PartId) -> Option<PartId> {
        let inputs = self.get_connected_input_slots(PartOutputSlot { part, index: 0 });
        match inputs.as_slice() {
            [only] => Some(only.part),
            _ => None,
        }
    }

    /// Source parts of `part`, one per input slot, in slot order.
    pub fn source_parts(&self, part: PartId) -> Vec<PartOutputSlot> {
        let num = self
            .part(part)
            .map(Part::num_input_slots)
            .unwrap_or_default();
        (0..num)
            .filter_map(|index| self.get_connected_output_slot(PartInputSlot { part, index }))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parts::{InputPart, OutputPart, PartCommon};
    use crate::tensor::{DataType, QuantizationInfo, TensorInfo, TensorShape};
    use std::collections::BTreeSet;

    fn info() -> TensorInfo {
        TensorInfo::new(
            TensorShape::new(1, 16, 16, 16),
            DataType::QAsymmU8,
            QuantizationInfo::new(0, 1.0),
        )
    }

    fn two_part_graph() -> GraphOfParts {
        let mut graph = GraphOfParts::new();
        graph
            .add_part(Part::Input(InputPart {
                common: PartCommon::new(PartId(0), BTreeSet::from([0])),
                tensor_info: info(),
            }))
            .unwrap();
        graph
            .add_part(Part::Output(OutputPart {
                common: PartCommon::new(PartId(1), BTreeSet::from([1])),
                tensor_info: info(),
            }))
            .unwrap();
        graph
    }

    #[test]
    fn test_connect_and_query() {
        let mut graph = two_part_graph();
        let output = PartOutputSlot {
            part: PartId(0),
            index: 0,
        };
        let input = PartInputSlot {
            part: PartId(1),
            index: 0,
        };
        graph.connect(output, input).unwrap();

        assert_eq!(graph.get_connected_output_slot(input), Some(output));
        assert_eq!(graph.get_connected_input_slots(output), vec![input]);
        assert!(graph.is_complete());
        assert_eq!(graph.single_consumer(PartId(0)), Some(PartId(1)));
    }

    #[test]
    fn test_double_connect_rejected() {
        let mut graph = two_part_graph();
        let output = PartOutputSlot {
            part: PartId(0),
            index: 0,
        };
        let input = PartInputSlot {
            part: PartId(1),
            index: 0,
        };
        graph.connect(output, input).unwrap();
        assert!(graph.connect(output, input).is_err());
    }

    #[test]
    fn test_backward_edge_rejected() {
        let mut graph = two_part_graph();
        // Output parts have no output slots at all, but the direction check
        // fires first for a reversed pair of valid-looking ids.
        let backward = graph.connect(
            PartOutputSlot {
                part: PartId(1),
                index: 0,
            },
            PartInputSlot {
                part: PartId(0),
                index: 0,
            },
        );
        assert!(backward.is_err());
    }

    #[test]
    fn test_out_of_order_id_rejected() {
        let mut graph = GraphOfParts::new();
        let part = Part::Input(InputPart {
            common: PartCommon::new(PartId(5), BTreeSet::new()),
            tensor_info: info(),
        });
        assert!(graph.add_part(part).is_err());
    }
}
