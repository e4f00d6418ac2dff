//! The media driver proper: three agents (sender, receiver, conductor),
//! the entities they manage (publications, images, endpoints) and the
//! strategies that parameterise them (flow control, congestion control,
//! loss feedback).

pub mod agent;
pub mod commands;
pub mod conductor;
pub mod congestion;
pub mod context;
pub mod destination;
pub mod dispatcher;
pub mod endpoint;
pub mod flow_control;
pub mod image;
pub mod ipc_publication;
pub mod loss_detector;
pub mod media_driver;
pub mod publication;
pub mod receiver;
pub mod resolver;
pub mod sender;
pub mod system_counters;
pub mod uri;
