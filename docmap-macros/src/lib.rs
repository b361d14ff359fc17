//! Procedural macros for the docmap project.
//!
//! - `#[derive(Entity)]` describes a struct's fields to the mapper and makes the struct
//!   usable as an embedded value.
//! - `#[derive(MappedEnum)]` persists a fieldless enum by variant name.
//!
//! # Example
//!
//! ```ignore
//! use docmap::prelude::*;
//!
//! #[derive(Debug, Clone, Default, Entity)]
//! #[entity(collection = "users", post_load = "after_load")]
//! struct User {
//!     #[mapped(id)]
//!     id: ObjectId,
//!     #[mapped(name = "n")]
//!     name: String,
//!     #[mapped(reference(lazy))]
//!     team: Option<Reference<Team>>,
//!     #[mapped(transient)]
//!     loaded: bool,
//! }
//!
//! impl User {
//!     fn after_load(&mut self, _document: &mut Document) {
//!         self.loaded = true;
//!     }
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as docmap_macros;

mod entity;
mod mapped_enum;

use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

/// Derives `Entity` and `Persist` for a struct with named fields.
///
/// Container attributes, under `#[entity(..)]`:
///
/// * `collection = "name"` - the collection, defaulting to the struct name
/// * `class_name = "name"` - the name stored in `className`
/// * `no_class_name` - do not store `className`
/// * `codec = "expr"` - a class-level codec expression, may be repeated
/// * `pre_persist`, `pre_save`, `pre_load`, `post_load` `= "method"` - lifecycle hooks,
///   each a `fn(&mut self, &mut Document)` method
///
/// Field attributes, under `#[mapped(..)]`: `id`, `version`, `embedded`, `property`,
/// `transient`, `reference`, `reference(lazy, ignore_missing, require_lazy)` and
/// `name = "stored"`.
#[proc_macro_derive(Entity, attributes(entity, mapped))]
pub fn derive_entity(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    entity::expand(input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

/// Derives `MappedEnum` and `Persist` for a fieldless enum.
#[proc_macro_derive(MappedEnum)]
pub fn derive_mapped_enum(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    mapped_enum::expand(input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}
