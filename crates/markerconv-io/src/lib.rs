pub mod lists;
pub mod seeds;

pub use lists::{read_image_list, write_image_list};
pub use seeds::{read_seeds, write_seeds};
