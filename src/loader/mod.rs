//! ELF64 executable loading, lazily registered into the supplemental page
//! table rather than copied in eagerly — see [`elf`].

pub mod elf;
