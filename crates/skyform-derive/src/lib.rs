//! Provides derive macros for `sky::HasDependencies`.
use quote::{format_ident, quote};
use syn::{
    punctuated::Punctuated, Data, DataEnum, DataStruct, DeriveInput, Field, Fields, Token,
    TypeTuple,
};

/// Returns whether the field is marked `#[sky(skip)]`.
fn is_skipped(field: &Field) -> syn::Result<bool> {
    let mut skip = false;
    for att in field.attrs.iter() {
        if att.path().is_ident("sky") {
            att.parse_nested_meta(|meta| {
                if meta.path.is_ident("skip") {
                    skip = true;
                    Ok(())
                } else {
                    Err(meta.error(format!(
                        "unsupported field attribute {:?} - must be 'skip'",
                        meta.path
                            .get_ident()
                            .map(|id| id.to_string())
                            .unwrap_or("unknown".to_string())
                    )))
                }
            })?;
        }
    }
    Ok(skip)
}

struct Merge {
    body: proc_macro2::TokenStream,
    where_constraints: Vec<proc_macro2::TokenStream>,
}

/// Builds a pattern that destructures `fields` and an expression that merges
/// the dependencies of every bound, non-skipped field.
fn merge_fields(
    fields: &Fields,
    where_constraints: &mut Vec<proc_macro2::TokenStream>,
) -> syn::Result<(proc_macro2::TokenStream, proc_macro2::TokenStream)> {
    let mut merges = vec![];
    let pattern = match fields {
        Fields::Named(named) => {
            let mut binds = vec![];
            for field in named.named.iter() {
                // UNWRAP: safe because these are named fields
                let ident = field.ident.clone().unwrap();
                if is_skipped(field)? {
                    binds.push(quote! { #ident: _ });
                    continue;
                }
                let ty = &field.ty;
                where_constraints.push(quote! { #ty: sky::HasDependencies });
                merges.push(quote! { .merge(sky::HasDependencies::dependencies(#ident)) });
                binds.push(quote! { #ident });
            }
            quote! { { #(#binds),* } }
        }
        Fields::Unnamed(unnamed) => {
            let mut binds = vec![];
            for (i, field) in unnamed.unnamed.iter().enumerate() {
                if is_skipped(field)? {
                    binds.push(quote! { _ });
                    continue;
                }
                let ident = format_ident!("field_{i}");
                let ty = &field.ty;
                where_constraints.push(quote! { #ty: sky::HasDependencies });
                merges.push(quote! { .merge(sky::HasDependencies::dependencies(#ident)) });
                binds.push(quote! { #ident });
            }
            quote! { ( #(#binds),* ) }
        }
        Fields::Unit => quote! {},
    };
    Ok((
        pattern,
        quote! {
            sky::Dependencies::default() #(#merges)*
        },
    ))
}

fn get_merge(input: &DeriveInput) -> syn::Result<Merge> {
    let name = &input.ident;
    let mut where_constraints = vec![];
    let body = match &input.data {
        Data::Struct(DataStruct { fields, .. }) => {
            let (pattern, merged) = merge_fields(fields, &mut where_constraints)?;
            quote! {
                let #name #pattern = self;
                #merged
            }
        }
        Data::Enum(DataEnum { variants, .. }) => {
            let mut arms = vec![];
            for variant in variants.iter() {
                let ident = &variant.ident;
                let (pattern, merged) = merge_fields(&variant.fields, &mut where_constraints)?;
                arms.push(quote! {
                    #name::#ident #pattern => { #merged }
                });
            }
            if arms.is_empty() {
                quote! { sky::Dependencies::default() }
            } else {
                quote! {
                    match self {
                        #(#arms)*
                    }
                }
            }
        }
        Data::Union(_) => {
            return Err(syn::Error::new(
                name.span(),
                "deriving HasDependencies is not supported for unions".to_string(),
            ));
        }
    };
    Ok(Merge {
        body,
        where_constraints,
    })
}

#[proc_macro_derive(HasDependencies, attributes(sky))]
pub fn derive_has_dependencies(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let input: DeriveInput = syn::parse_macro_input!(input);
    let name = &input.ident;
    let Merge {
        body,
        where_constraints,
    } = match get_merge(&input) {
        Ok(m) => m,
        Err(e) => return e.into_compile_error().into(),
    };
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    let mut predicates = where_clause
        .map(|w| w.predicates.iter().map(|p| quote! { #p }).collect::<Vec<_>>())
        .unwrap_or_default();
    predicates.extend(where_constraints);

    let output = quote! {
        impl #impl_generics sky::HasDependencies for #name #ty_generics
        where
            #(#predicates),*
        {
            #[allow(unused_variables)]
            fn dependencies(&self) -> sky::Dependencies {
                #body
            }
        }
    };
    output.into()
}

/// Implements `HasDependencies` for a tuple of type parameters, eg
/// `impl_has_dependencies_tuples!((A, B, C))`.
#[proc_macro]
pub fn impl_has_dependencies_tuples(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let tuple: TypeTuple = syn::parse_macro_input!(input);
    let params: Punctuated<syn::Type, Token![,]> = tuple.elems;
    let idents = params
        .iter()
        .enumerate()
        .map(|(i, _)| format_ident!("t{i}"))
        .collect::<Vec<_>>();
    let output = quote! {
        impl<#(#params: sky::HasDependencies),*> sky::HasDependencies for (#(#params,)*) {
            fn dependencies(&self) -> sky::Dependencies {
                let (#(#idents,)*) = self;
                sky::Dependencies::default()
                    #(.merge(sky::HasDependencies::dependencies(#idents)))*
            }
        }
    };
    output.into()
}
