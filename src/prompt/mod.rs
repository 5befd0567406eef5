pub mod compose;
pub mod injector;
