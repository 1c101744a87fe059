#![feature(impl_trait_in_assoc_type)]

pub type AnyError = anyhow::Error;

pub mod command;
pub mod common;
pub mod http;
pub mod proxy;
pub mod router;
pub mod routing;
pub mod tls;
pub mod worker;
