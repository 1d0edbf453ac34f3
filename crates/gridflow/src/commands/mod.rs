pub mod check;
pub mod create;
pub mod list;
pub mod scale;
pub mod status;
pub mod terminate;
