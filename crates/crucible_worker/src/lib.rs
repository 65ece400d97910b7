//! Crucible evaluation worker.
//!
//! A worker process consumes one broker envelope at a time. A defense
//! envelope turns it into a [`executor::DefenseExecutor`] run: one live
//! defense container, one internal attack queue, one evaluation loop. An
//! attack envelope runs the [`dispatcher::AttackDispatcher`], which routes
//! the attack to every validated defense.

pub mod blob;
pub mod dispatcher;
pub mod evaluate;
pub mod executor;
pub mod gateway;
pub mod sandbox;
pub mod shutdown;
pub mod source;
pub mod validation;

pub use blob::BlobStore;
pub use dispatcher::AttackDispatcher;
pub use executor::DefenseExecutor;
pub use gateway::{Gateway, GatewayError, GatewayResponse, HttpGateway};
pub use sandbox::{ContainerHandle, ContainerRuntime, ContainerSpec, DockerRuntime, Sandbox};
pub use shutdown::ShutdownToken;
