pub mod aqlm;
