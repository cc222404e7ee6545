pub mod broker_client;
pub mod control_server;
pub mod data_plane;
pub mod event_loop;
pub mod multicast;
