pub mod ade7953;
