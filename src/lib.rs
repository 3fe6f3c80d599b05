//! Turns a set of Proxmox VMs into a kubeadm Kubernetes cluster.

pub mod commands;
pub mod config;
pub mod error;
pub mod inventory;
pub mod patch;
pub mod pool;
pub mod proxmox;
pub mod runner;
pub mod services;
pub mod templates;
pub mod utils;

pub use error::{Result, SetupError};
