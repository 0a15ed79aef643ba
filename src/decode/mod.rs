pub mod pperf;
