pub mod atomic_stack;
pub mod bitmap;
pub mod slots;
