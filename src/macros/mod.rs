#[macro_use]
mod kinds;
