//! A derive macro for the `RemoteExecute` trait.
//!
//! Loop bodies and reductions travel to workers as opaque calls that only name
//! their type by a string id. This macro assigns that id and registers an
//! entry point for the type with the [`linkme`](https://docs.rs/linkme)
//! distributed slice `tally::__private::REMOTE_ENTRIES`, whose elements the
//! linker gathers into one contiguous section of the binary.
//!
//! # Attributes
//!
//! - `#[tally(body)]`: the type implements `LoopBody`, and calls run it over a
//!   chunk with `executor::parallel_for::execute_chunk`.
//! - `#[tally(reduction)]`: the type implements `Reduction`, and calls reduce a
//!   chunk with `executor::parallel_reduce::execute_chunk`.
//! - `#[tally(internal)]`: generated paths start at `crate` rather than
//!   `::tally`. Only for use inside `tally` itself.
//!
//! # Implementation details
//!
//! The id is the type's module path followed by its name, so it is identical
//! in every binary the type is linked into. The generated entry point is a
//! plain function pointer, which keeps the registry a static table. Generic
//! types are rejected, since every instantiation would need its own entry.
extern crate proc_macro;

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Attribute, DeriveInput, Error, Ident, Result};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Kind {
    Body,
    Reduction,
}

#[derive(Default)]
struct Options {
    internal: bool,
    kind: Option<Kind>,
}

/// Collect every `#[tally(...)]` option, removing the attributes.
fn parse_options(attrs: &mut Vec<Attribute>) -> Result<Options> {
    let mut options = Options::default();
    let mut errors: Option<Error> = None;

    attrs.retain(|attr| {
        if !attr.path().is_ident("tally") {
            return true;
        }
        if let Err(err) = attr.parse_nested_meta(|meta| {
            let kind = if meta.path.is_ident("internal") {
                if options.internal {
                    return Err(meta.error("duplicate tally crate attribute"));
                }
                options.internal = true;
                return Ok(());
            } else if meta.path.is_ident("body") {
                Kind::Body
            } else if meta.path.is_ident("reduction") {
                Kind::Reduction
            } else {
                return Err(meta.error("unsupported tally attribute"));
            };

            if options.kind.is_some() {
                return Err(meta.error("a type is either a `body` or a `reduction`, not both"));
            }
            options.kind = Some(kind);
            Ok(())
        }) {
            match &mut errors {
                None => errors = Some(err),
                Some(errors) => errors.combine(err),
            }
        }
        false
    });

    match errors {
        None => Ok(options),
        Some(errors) => Err(errors),
    }
}

/// See the [module level documentation](crate) for more information.
#[proc_macro_derive(RemoteExecute, attributes(tally))]
pub fn remote_execute_derive(input: TokenStream) -> TokenStream {
    let mut input = parse_macro_input!(input as DeriveInput);

    let options = match parse_options(&mut input.attrs) {
        Ok(options) => options,
        Err(err) => return err.to_compile_error().into(),
    };

    let name = &input.ident;
    if !input.generics.params.is_empty() {
        return Error::new_spanned(
            &input.generics,
            "RemoteExecute cannot be derived for generic types; register a concrete type instead",
        )
        .to_compile_error()
        .into();
    }
    let Some(kind) = options.kind else {
        return Error::new_spanned(
            name,
            "expected `#[tally(body)]` or `#[tally(reduction)]` next to `#[derive(RemoteExecute)]`",
        )
        .to_compile_error()
        .into();
    };

    // The path to the `tally` crate.
    let tally_path = if options.internal {
        quote! { crate }
    } else {
        quote! { ::tally }
    };

    // Outside of `tally`, point `linkme` at the re-export so consumers do not
    // need their own `linkme` dependency.
    let linkme_path_override = if options.internal {
        quote! {}
    } else {
        quote! {
            #[linkme(crate=#tally_path::__private::linkme)]
        }
    };

    let execute_chunk = match kind {
        Kind::Body => quote! { #tally_path::executor::parallel_for::execute_chunk::<#name> },
        Kind::Reduction => quote! { #tally_path::executor::parallel_reduce::execute_chunk::<#name> },
    };

    let entry_name = Ident::new(&format!("__TALLY_REMOTE_ENTRY_{}", name), name.span());
    let invoke_name = Ident::new(&format!("__tally_invoke_{}", name), name.span());

    let expanded = quote! {
        impl #tally_path::task::RemoteExecute for #name {
            const ID: &'static str = concat!(module_path!(), "::", stringify!(#name));
        }

        #[doc(hidden)]
        #[allow(non_snake_case)]
        fn #invoke_name(
            call: #tally_path::transport::RemoteCall,
            context: #tally_path::runtime::WorkerContext,
        ) -> #tally_path::__private::futures::future::BoxFuture<'static, #tally_path::transport::RemoteOutcome> {
            Box::pin(#execute_chunk(call, context))
        }

        #[doc(hidden)]
        #[allow(non_upper_case_globals)]
        #[#tally_path::__private::linkme::distributed_slice(#tally_path::__private::REMOTE_ENTRIES)]
        #linkme_path_override
        static #entry_name: #tally_path::task::RemoteEntry = #tally_path::task::RemoteEntry {
            id: <#name as #tally_path::task::RemoteExecute>::ID,
            invoke: #invoke_name,
        };
    };

    TokenStream::from(expanded)
}
