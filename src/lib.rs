//! CHEKT Bridge Library
//!
//! Edge bridge between on-site IP cameras and the CHEKT monitoring backend
//!
//! ## Architecture
//!
//! 1. SmtpServer - Alarm mail intake from cameras
//! 2. MailDecoder - MIME message to text/attachment parts
//! 3. AlarmParser - Vendor alarm recognition (parser registry per protocol)
//! 4. AlarmPipeline - Parse, correlate, upload artifacts, persist alarm rows
//! 5. Recorder - Per-camera packet/snapshot ring buffers fed by capture tools
//! 6. RecordingFleet - One recorder per camera
//! 7. CommandSession - Realtime commands (discover, export) with correlated responses
//! 8. Registration - Bridge announcement and approval polling
//! 9. Backend - Supabase REST, storage and realtime clients
//! 10. Discovery - ONVIF WS-Discovery

pub mod alarm_parser;
pub mod alarm_pipeline;
pub mod backend;
pub mod command_session;
pub mod config;
pub mod discovery;
pub mod error;
pub mod inventory;
pub mod mail_decoder;
pub mod models;
pub mod recorder;
pub mod recording_fleet;
pub mod registration;
pub mod smtp_server;

pub use config::{BridgeConfig, BridgeIdentity, RecorderConfig};
pub use error::{Error, Result};
