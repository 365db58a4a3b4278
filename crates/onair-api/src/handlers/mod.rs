pub mod studios;
pub mod tracks;
pub mod uploads;
