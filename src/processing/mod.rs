mod block_processor;
mod confirming_set;

pub use block_processor::{
    BlockContext, BlockProcessor, BlockProcessorConfig, BlockSource, ProcessedItem,
};
pub use confirming_set::{CementedNotification, ConfirmingSet, ConfirmingSetConfig};
