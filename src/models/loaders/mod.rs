pub mod toml_loader;

pub use toml_loader::{load_all_atoms, load_atom_file};
