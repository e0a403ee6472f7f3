mod aqlm;

pub use aqlm::AqlmOps;
