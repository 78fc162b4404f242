pub mod servers;
pub mod system;
