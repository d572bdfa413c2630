//! Low-level commands and the assembled command stream.
//!
//! Commands are register-write batches parameterised by agent and stripe id.
//! They live in four queues, one per hardware unit; ordering between queues
//! exists only through explicit [`Command::WaitForCounter`] entries.

use crate::agents::Agent;
use ethosn_chip::Version;

/// Hardware progress counters. Single producer, multiple observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterName {
    /// Incremented per completed DMA read.
    DmaRd,
    /// Incremented per completed DMA write.
    DmaWr,
    /// Incremented per completed MCE stripe.
    MceStripe,
    /// Incremented per completed PLE stripe.
    PleStripe,
}

impl CounterName {
    /// Wire tag.
    pub const fn code(self) -> u32 {
        match self {
            Self::DmaRd => 0,
            Self::DmaWr => 1,
            Self::MceStripe => 2,
            Self::PleStripe => 3,
        }
    }

    /// Inverse of [`Self::code`].
    pub const fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => Self::DmaRd,
            1 => Self::DmaWr,
            2 => Self::MceStripe,
            3 => Self::PleStripe,
            _ => return None,
        })
    }

    /// XML tag.
    pub const fn name(self) -> &'static str {
        match self {
            Self::DmaRd => "DMA_RD",
            Self::DmaWr => "DMA_WR",
            Self::MceStripe => "MCE_STRIPE",
            Self::PleStripe => "PLE_STRIPE",
        }
    }
}

/// The four firmware queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// DMA read queue (IFM and weight loads).
    DmaRd,
    /// DMA write queue (OFM stores).
    DmaWr,
    /// MCE queue.
    Mce,
    /// PLE queue.
    Ple,
}

/// One firmware command.
///
/// Counters advance monotonically and wrap at `u16`; the firmware compares
/// `counter >= target` modularly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Block the queue until `counter >= target` (modular).
    WaitForCounter {
        /// Counter to observe.
        counter: CounterName,
        /// Target value.
        target: u16,
    },
    /// Load one IFM stripe into its tile slot.
    LoadIfmStripe {
        /// Owning agent.
        agent_id: u32,
        /// Stripe index within the agent.
        stripe_id: u32,
    },
    /// Load one weight stripe into its tile slot.
    LoadWgtStripe {
        /// Owning agent.
        agent_id: u32,
        /// Stripe index within the agent.
        stripe_id: u32,
    },
    /// Store one OFM stripe to DRAM.
    StoreOfmStripe {
        /// Owning agent.
        agent_id: u32,
        /// Stripe index within the agent.
        stripe_id: u32,
    },
    /// Program MCE registers for one stripe.
    ProgramMceStripe {
        /// Owning agent.
        agent_id: u32,
        /// Stripe index within the agent.
        stripe_id: u32,
    },
    /// Configure the MCE-PLE interface for the agent's kernel.
    ConfigMceif {
        /// Owning agent.
        agent_id: u32,
    },
    /// Kick one MCE stripe.
    StartMceStripe {
        /// Owning agent.
        agent_id: u32,
        /// Stripe index within the agent.
        stripe_id: u32,
    },
    /// Copy PLE kernel code into PLE SRAM.
    LoadPleCodeIntoPleSram {
        /// Owning loader agent.
        agent_id: u32,
    },
    /// Kick one PLE stripe.
    StartPleStripe {
        /// Owning agent.
        agent_id: u32,
        /// Stripe index within the agent.
        stripe_id: u32,
    },
}

impl Command {
    /// Wire tag of the variant.
    pub const fn kind_code(&self) -> u32 {
        match self {
            Self::WaitForCounter { .. } => 0,
            Self::LoadIfmStripe { .. } => 1,
            Self::LoadWgtStripe { .. } => 2,
            Self::StoreOfmStripe { .. } => 3,
            Self::ProgramMceStripe { .. } => 4,
            Self::ConfigMceif { .. } => 5,
            Self::StartMceStripe { .. } => 6,
            Self::LoadPleCodeIntoPleSram { .. } => 7,
            Self::StartPleStripe { .. } => 8,
        }
    }

    /// XML element name of the variant.
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::WaitForCounter { .. } => "WAIT_FOR_COUNTER_COMMAND",
            Self::LoadIfmStripe { .. } => "LOAD_IFM_STRIPE_COMMAND",
            Self::LoadWgtStripe { .. } => "LOAD_WGT_STRIPE_COMMAND",
            Self::StoreOfmStripe { .. } => "STORE_OFM_STRIPE_COMMAND",
            Self::ProgramMceStripe { .. } => "PROGRAM_MCE_STRIPE_COMMAND",
            Self::ConfigMceif { .. } => "CONFIG_MCEIF_COMMAND",
            Self::StartMceStripe { .. } => "START_MCE_STRIPE_COMMAND",
            Self::LoadPleCodeIntoPleSram { .. } => "LOAD_PLE_CODE_COMMAND",
            Self::StartPleStripe { .. } => "START_PLE_STRIPE_COMMAND",
        }
    }
}

/// A parsed or assembled command stream: agents plus the four queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStream {
    /// Version stamped on the stream.
    pub version: Version,
    /// Agents, indexed by agent id.
    pub agents: Vec<Agent>,
    /// DMA read queue.
    pub dma_rd_commands: Vec<Command>,
    /// DMA write queue.
    pub dma_wr_commands: Vec<Command>,
    /// MCE queue.
    pub mce_commands: Vec<Command>,
    /// PLE queue.
    pub ple_commands: Vec<Command>,
}

impl CommandStream {
    /// An empty stream at `version`.
    pub const fn new(version: Version) -> Self {
        Self {
            version,
            agents: Vec::new(),
            dma_rd_commands: Vec::new(),
            dma_wr_commands: Vec::new(),
            mce_commands: Vec::new(),
            ple_commands: Vec::new(),
        }
    }

    /// The queue a command belongs to, by construction of the emitter.
    pub fn queue_mut(&mut self, queue: QueueKind) -> &mut Vec<Command> {
        match queue {
            QueueKind::DmaRd => &mut self.dma_rd_commands,
            QueueKind::DmaWr => &mut self.dma_wr_commands,
            QueueKind::Mce => &mut self.mce_commands,
            QueueKind::Ple => &mut self.ple_commands,
        }
    }

    /// Total command count across the four queues.
    pub fn num_commands(&self) -> usize {
        self.dma_rd_commands.len()
            + self.dma_wr_commands.len()
            + self.mce_commands.len()
            + self.ple_commands.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethosn_chip::version::COMMAND_STREAM_VERSION;

    #[test]
    fn test_counter_codes_round_trip() {
        for counter in [
            CounterName::DmaRd,
            CounterName::DmaWr,
            CounterName::MceStripe,
            CounterName::PleStripe,
        ] {
            assert_eq!(CounterName::from_code(counter.code()), Some(counter));
        }
        assert_eq!(CounterName::from_code(9), None);
    }

    #[test]
    fn test_queue_mut_routes() {
        let mut stream = CommandStream::new(COMMAND_STREAM_VERSION);
        stream
            .queue_mut(QueueKind::Mce)
            .push(Command::ConfigMceif { agent_id: 0 });
        assert_eq!(stream.mce_commands.len(), 1);
        assert_eq!(stream.num_commands(), 1);
    }
}
