pub mod cancel;
pub mod color;
pub mod config;
pub mod face;
pub mod frame;
pub mod gestures;
pub mod lifecycle;
pub mod motion;
pub mod notify;
pub mod qrcode;
pub mod task;
