//! Double-buffered real-time data-flow core.
//!
//! GAMs declare signals; the [`registry`] turns them into double-buffered
//! channels; [`broker`]s copy channel contents to and from GAM memory every
//! cycle; the [`scheduler`] runs the GAMs of one state on one buffer while
//! the next state is prepared on the other.

pub mod app;
pub mod broker;
pub mod channel;
pub mod config;
pub mod definition;
pub mod error;
pub mod gam;
pub mod gams;
#[doc(hidden)]
pub mod invariant_ppt;
pub mod invariant_rt;
pub mod logger;
pub mod memory;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod types;
pub mod value;

pub use app::Application;
pub use broker::{ReaderBroker, StaticMemory, WriterBroker};
pub use channel::DataChannel;
pub use definition::DataDefinition;
pub use error::{Error, ErrorKind, Result};
pub use gam::{Direction, Gam, GamDefinitions, GamFactory, GamIo, GamPipeline};
pub use memory::{ByteBlock, SignalView};
pub use registry::{ChannelTable, DataChannelRegistry, StateInfo};
pub use scheduler::{Scheduler, SchedulerStatus, StateRecord, ThreadRecord};
pub use types::TypeRegistry;
