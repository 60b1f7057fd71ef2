//! Process state trees, batched transitions, and proof witnesses.

pub mod engine;
pub mod witness;

pub use engine::{BatchApplication, ProcessState, SlotBallot};
pub use witness::{MerkleTransition, SingletonProof, StateTransitionWitness};
