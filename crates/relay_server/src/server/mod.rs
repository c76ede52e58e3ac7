#![forbid(unsafe_code)]

pub mod accounts;
pub mod connection;
pub mod conversations;
pub mod http;
pub mod monitor;
pub mod presence;
pub mod router;

#[cfg(test)]
mod accounts_tests;





#[cfg(test)]
mod presence_tests;

#[cfg(test)]
mod router_tests;
