//! ir3 copy propagation and instruction scheduling.
//!
//! This crate takes an SSA-form ir3 instruction graph for an Adreno shader
//! and turns each basic block into a linear, hazard-legal emission order.
//! Two passes do the work:
//!
//! - [`Shader::opt_copy_prop`] folds move chains, immediates and constants
//!   into their consumers, within hardware encoding limits;
//! - [`Shader::schedule`] list-schedules each block over a dependency DAG,
//!   trading latency hiding against register pressure and serializing the
//!   address/predicate registers, cloning a live writer when that
//!   serialization deadlocks.
//!
//! Instruction selection, register allocation and binary encoding are
//! collaborators outside this crate; they exchange the [`ir::Shader`] graph
//! with it.

pub mod builder;
pub mod delay;
pub mod encode;
pub mod ir;
pub mod opt_copy_prop;
pub mod result;
pub mod sched;
pub mod sched_dag;
pub mod sched_deps;
pub mod verify;

pub use crate::builder::ShaderBuilder;
pub use crate::delay::{DelayModel, GenericDelayModel};
pub use crate::ir::Shader;
pub use crate::result::{SchedResult, ScheduleError};
pub use crate::sched::SchedConfig;
pub use crate::verify::check_schedule;
