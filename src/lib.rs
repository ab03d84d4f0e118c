//! emailworker — consume email requests from RabbitMQ and send them over SMTP.

pub mod binder;
pub mod broker;
pub mod config;
pub mod error;
pub mod mailer;
pub mod publisher;
pub mod request;
pub mod worker;
