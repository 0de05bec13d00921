//! The `#[function]` attribute for agora.
//!
//! The attribute leaves the annotated function untouched and emits, next to
//! it, a `static` named after the function in upper case. The static is an
//! `agora::function::StaticFunction` describing the function: its name,
//! island, normalized source text, dependencies and guards, plus a pointer to
//! a generated shim that unpacks keyword arguments, calls the function, and
//! lifts its output into a CBOR value.
//!
//! The static is also collected into a link-time catalogue with
//! [`linkme`](https://docs.rs/linkme), from which every portal registers the
//! declared functions when it opens. Worker processes are copies of the same
//! binary, so they find every function a queued call may name.
//!
//! # Arguments
//!
//! - `island = "name"`: the island to register the function in. Defaults to
//!   the portal's default island.
//! - `guards(a, b)`: guard functions of type `fn(&Portal, &Kwargs) -> bool`,
//!   all of which must pass for a call to run.
//! - `depends_on(f, g)`: dependencies in addition to those detected in the
//!   body. Calls of the form `NAME.call(..)` or `NAME.execute(..)` are
//!   detected automatically.
//!
//! A parameter of type `&Portal` receives the portal the call runs in. Every
//! other parameter is read from the keyword argument of the same name.
extern crate proc_macro;

use std::collections::BTreeSet;

use proc_macro::TokenStream;
use proc_macro2::{Span, TokenStream as TokenStream2, TokenTree};
use quote::{quote, ToTokens};
use syn::{
    meta::ParseNestedMeta, parse_macro_input, Error, FnArg, Ident, ItemFn, LitStr, Pat,
    ReturnType, Type,
};

#[derive(Default)]
struct FunctionArgs {
    island: Option<LitStr>,
    guards: Vec<Ident>,
    dependencies: Vec<Ident>,
    internal: bool,
}

impl FunctionArgs {
    fn parse(&mut self, meta: ParseNestedMeta) -> syn::Result<()> {
        if meta.path.is_ident("island") {
            if self.island.is_some() {
                return Err(meta.error("duplicate island"));
            }
            self.island = Some(meta.value()?.parse()?);
            Ok(())
        } else if meta.path.is_ident("guards") {
            meta.parse_nested_meta(|inner| {
                self.guards.push(ident_of(&inner)?);
                Ok(())
            })
        } else if meta.path.is_ident("depends_on") {
            meta.parse_nested_meta(|inner| {
                self.dependencies.push(ident_of(&inner)?);
                Ok(())
            })
        } else if meta.path.is_ident("internal") {
            self.internal = true;
            Ok(())
        } else {
            Err(meta.error("unsupported agora function attribute"))
        }
    }
}

fn ident_of(meta: &ParseNestedMeta) -> syn::Result<Ident> {
    meta.path
        .get_ident()
        .cloned()
        .ok_or_else(|| meta.error("expected a function name"))
}

enum Param {
    Portal,
    Kwarg { name: Ident, ty: Box<Type> },
}

fn is_portal_ref(ty: &Type) -> bool {
    match ty {
        Type::Reference(reference) => match reference.elem.as_ref() {
            Type::Path(path) => path
                .path
                .segments
                .last()
                .is_some_and(|segment| segment.ident == "Portal"),
            _ => false,
        },
        _ => false,
    }
}

fn params(item: &ItemFn) -> syn::Result<Vec<Param>> {
    item.sig
        .inputs
        .iter()
        .map(|input| match input {
            FnArg::Receiver(receiver) => Err(Error::new_spanned(
                receiver,
                "agora functions cannot take self",
            )),
            FnArg::Typed(typed) if is_portal_ref(&typed.ty) => Ok(Param::Portal),
            FnArg::Typed(typed) => match typed.pat.as_ref() {
                Pat::Ident(pat) if matches!(*typed.ty, Type::Reference(_)) => Err(
                    Error::new_spanned(&typed.ty, format!("argument `{}` must be owned", pat.ident)),
                ),
                Pat::Ident(pat) => Ok(Param::Kwarg {
                    name: pat.ident.clone(),
                    ty: typed.ty.clone(),
                }),
                other => Err(Error::new_spanned(other, "expected a plain argument name")),
            },
        })
        .collect()
}

fn returns_result(item: &ItemFn) -> bool {
    match &item.sig.output {
        ReturnType::Type(_, ty) => match ty.as_ref() {
            Type::Path(path) => path
                .path
                .segments
                .last()
                .is_some_and(|segment| segment.ident == "Result"),
            _ => false,
        },
        ReturnType::Default => false,
    }
}

/// Collects `NAME` from every `NAME.call` and `NAME.execute` in `tokens`.
fn detect_dependencies(tokens: TokenStream2, found: &mut BTreeSet<String>) {
    let tokens: Vec<TokenTree> = tokens.into_iter().collect();
    for (i, token) in tokens.iter().enumerate() {
        match token {
            TokenTree::Group(group) => detect_dependencies(group.stream(), found),
            TokenTree::Ident(ident) => {
                let name = ident.to_string();
                let is_static = name.chars().any(|c| c.is_ascii_uppercase())
                    && name
                        .chars()
                        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
                let calls = matches!(
                    (tokens.get(i + 1), tokens.get(i + 2)),
                    (Some(TokenTree::Punct(dot)), Some(TokenTree::Ident(method)))
                        if dot.as_char() == '.' && (method == "call" || method == "execute")
                );
                if is_static && calls {
                    found.insert(name.to_lowercase());
                }
            }
            _ => {}
        }
    }
}

/// The source text a function is identified by: its tokens, without doc
/// comments, so that editing documentation keeps cached results valid.
fn normalized_source(item: &ItemFn) -> String {
    let mut item = item.clone();
    item.attrs.retain(|attr| !attr.path().is_ident("doc"));
    item.to_token_stream().to_string()
}

fn expand(args: FunctionArgs, item: ItemFn) -> syn::Result<TokenStream2> {
    if !item.sig.generics.params.is_empty() {
        return Err(Error::new_spanned(
            &item.sig.generics,
            "agora functions cannot be generic",
        ));
    }
    if item.sig.asyncness.is_some() {
        return Err(Error::new_spanned(
            item.sig.asyncness,
            "agora functions cannot be async",
        ));
    }

    // The path to the `agora` crate. Inside the crate itself it is `crate`.
    let agora = if args.internal {
        quote! { crate }
    } else {
        quote! { ::agora }
    };
    // Point linkme at agora's re-export so that callers do not need to depend
    // on it.
    let linkme_path_override = if args.internal {
        quote! {}
    } else {
        quote! { #[linkme(crate = #agora::__private::linkme)] }
    };

    let name = &item.sig.ident;
    let name_str = name.to_string();
    let vis = &item.vis;
    let static_name = Ident::new(&name_str.to_uppercase(), name.span());
    let shim = Ident::new(&format!("__agora_call_{name_str}"), Span::call_site());
    let source = normalized_source(&item);

    let mut dependencies = BTreeSet::new();
    detect_dependencies(item.block.to_token_stream(), &mut dependencies);
    dependencies.extend(args.dependencies.iter().map(Ident::to_string));
    let dependencies = dependencies.iter();

    let island = match &args.island {
        Some(island) => quote! { ::core::option::Option::Some(#island) },
        None => quote! { ::core::option::Option::None },
    };
    let guards = args.guards.iter().map(|guard| {
        let guard_name = guard.to_string();
        quote! {
            #agora::function::StaticGuard { name: #guard_name, check: #guard }
        }
    });

    let params = params(&item)?;
    let unpack = params.iter().filter_map(|param| match param {
        Param::Kwarg { name, ty } => {
            let key = name.to_string();
            Some(quote! { let #name: #ty = __kwargs.get::<#ty>(#key)?; })
        }
        Param::Portal => None,
    });
    let call_args = params.iter().map(|param| match param {
        Param::Kwarg { name, .. } => quote! { #name },
        Param::Portal => quote! { __portal },
    });
    let call = if returns_result(&item) {
        quote! { #name(#(#call_args),*)? }
    } else {
        quote! { #name(#(#call_args),*) }
    };

    Ok(quote! {
        #item

        #[doc(hidden)]
        #[allow(non_snake_case, unused_variables)]
        fn #shim(
            __portal: &#agora::portal::Portal,
            __kwargs: &#agora::function::Kwargs,
        ) -> #agora::__private::anyhow::Result<#agora::function::Value> {
            #(#unpack)*
            let output = #call;
            ::core::result::Result::Ok(#agora::serializer::to_value(&output)?)
        }

        #[doc = concat!("The agora declaration of [`", #name_str, "`].")]
        #[#agora::__private::linkme::distributed_slice(#agora::__private::FUNCTIONS)]
        #linkme_path_override
        #vis static #static_name: #agora::function::StaticFunction = #agora::function::StaticFunction {
            name: #name_str,
            island: #island,
            source: #source,
            dependencies: &[#(#dependencies),*],
            guards: &[#(#guards),*],
            call: #shim,
        };
    })
}

/// Declares a memoizable function. See the [crate level documentation](crate).
#[proc_macro_attribute]
pub fn function(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut args = FunctionArgs::default();
    let parser = syn::meta::parser(|meta| args.parse(meta));
    parse_macro_input!(attr with parser);
    let item = parse_macro_input!(item as ItemFn);

    expand(args, item)
        .unwrap_or_else(Error::into_compile_error)
        .into()
}

#[cfg(test)]
mod tests {
    use syn::parse_quote;

    use super::*;

    #[test]
    fn doc_comments_do_not_change_the_source() {
        let plain: ItemFn = parse_quote! {
            fn square(n: u64) -> u64 { n * n }
        };
        let documented: ItemFn = parse_quote! {
            /// Squares `n`.
            #[inline]
            fn square(n: u64) -> u64 { n * n }
        };
        let inlined: ItemFn = parse_quote! {
            #[inline]
            fn square(n: u64) -> u64 { n * n }
        };
        assert_eq!(normalized_source(&documented), normalized_source(&inlined));
        assert_ne!(normalized_source(&plain), normalized_source(&inlined));
        assert!(!normalized_source(&documented).contains("Squares"));
    }

    #[test]
    fn calls_to_declared_functions_are_dependencies() {
        let item: ItemFn = parse_quote! {
            fn total(n: u64) -> anyhow::Result<u64> {
                Ok(SQUARE.call::<u64>(kwargs! { n = n }?)? + helper(n) + CUBE.execute::<u64>(p, k)?)
            }
        };
        let mut found = BTreeSet::new();
        detect_dependencies(item.block.to_token_stream(), &mut found);
        assert_eq!(
            found,
            BTreeSet::from(["cube".to_string(), "square".to_string()])
        );
    }
}
