//! PEFT adapter implementations.

pub mod adalora;
pub mod boft;
pub mod hra;
pub mod lora;
pub mod miss;
pub mod oft;
pub mod rank_allocator;
