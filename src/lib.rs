//! Backup, restore and scheduling for Docker Compose based Odoo deployments.

pub mod cli;
pub mod core;
pub mod utils;
