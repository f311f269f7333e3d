//! Distributed training context: who this process is within the job and the collectives
//! it uses to stay in step with its peers.

mod env;
pub mod error;
mod group;
mod local;
mod master;

pub use env::DistEnv;
pub use error::{CommsErr, Result};
pub use group::{Communicator, CommunicatorTemplate, Solo};
pub use local::LocalGroup;
pub use master::wait_for_the_master;
