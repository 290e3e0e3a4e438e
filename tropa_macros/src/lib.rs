//! Procedural macros for `tropa`.

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, ItemStruct};

extern crate proc_macro;

/// Marks a struct as a serializable metric sink.
///
/// Adds the derive set every plain-data sink needs so it can be snapshotted,
/// cloned into chunk-local copies and compared in tests.
#[proc_macro_attribute]
pub fn sink(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(item as ItemStruct);
    let expanded = quote! {
        #[derive(
            serde::Serialize,
            serde::Deserialize,
            std::cmp::PartialEq,
            std::fmt::Debug,
            std::clone::Clone,
            std::default::Default
        )]
        #ast
    };

    TokenStream::from(expanded)
}

/// Marks a struct as a serializable summary value handed to reporters.
#[proc_macro_attribute]
pub fn summary(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(item as ItemStruct);
    let expanded = quote! {
        #[derive(
            serde::Serialize,
            serde::Deserialize,
            std::cmp::PartialEq,
            std::cmp::PartialOrd,
            std::fmt::Debug,
            std::clone::Clone,
            std::marker::Copy,
            std::default::Default
        )]
        #ast
    };

    TokenStream::from(expanded)
}
