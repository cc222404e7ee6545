pub mod buf_ext;
pub mod serial_number;
