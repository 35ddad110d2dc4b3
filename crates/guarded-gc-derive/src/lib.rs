//! Derive macro for the `ScanLayout` trait.
//!
//! ```ignore
//! use guarded_gc::Scan;
//!
//! #[derive(Scan)]
//! #[repr(C)]
//! struct Node {
//!     next: *mut Node,
//!     value: u64,
//!     #[scan(skip)]
//!     cached: *mut u8,
//! }
//! ```
//!
//! Each field contributes its own pointer offsets, shifted by the field's
//! offset in the struct. Fields marked `#[scan(skip)]` contribute nothing.

use proc_macro2::TokenStream;
use quote::{quote, quote_spanned};
use syn::{
    parse_macro_input, parse_quote, spanned::Spanned, Data, DeriveInput, Field, Fields,
    GenericParam, Generics, Index, Member, Path,
};

#[proc_macro_derive(Scan, attributes(scan))]
pub fn derive_scan(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let mut guarded_gc: Path = parse_quote!(::guarded_gc);

    for attr in &input.attrs {
        if !attr.path().is_ident("scan") {
            continue;
        }

        let result = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("crate") {
                guarded_gc = meta.value()?.parse()?;
                Ok(())
            } else {
                Err(meta.error("unsupported attribute"))
            }
        });

        if let Err(err) = result {
            return err.into_compile_error().into();
        }
    }

    let name = &input.ident;
    let generics = add_trait_bounds(&guarded_gc, input.generics);
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();
    let body = match generate_offsets_body(&guarded_gc, &input.data) {
        Ok(body) => body,
        Err(err) => return err.into_compile_error().into(),
    };

    let generated = quote! {
        unsafe impl #impl_generics #guarded_gc::ScanLayout for #name #ty_generics #where_clause {
            fn pointer_offsets() -> ::std::vec::Vec<usize> {
                #body
            }
        }
    };

    generated.into()
}

fn add_trait_bounds(guarded_gc: &Path, mut generics: Generics) -> Generics {
    for param in &mut generics.params {
        if let GenericParam::Type(ref mut type_param) = *param {
            let has_scan = type_param.bounds.iter().any(|b| {
                if let syn::TypeParamBound::Trait(t) = b {
                    t.path
                        .segments
                        .last()
                        .is_some_and(|s| s.ident == "ScanLayout")
                } else {
                    false
                }
            });
            let has_static = type_param.bounds.iter().any(|b| {
                if let syn::TypeParamBound::Lifetime(l) = b {
                    l.ident == "static"
                } else {
                    false
                }
            });

            if !has_scan {
                type_param.bounds.push(parse_quote!(#guarded_gc::ScanLayout));
            }
            if !has_static {
                type_param.bounds.push(parse_quote!('static));
            }
        }
    }
    generics
}

fn is_skipped(field: &Field) -> syn::Result<bool> {
    let mut skip = false;
    for attr in &field.attrs {
        if !attr.path().is_ident("scan") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("skip") {
                skip = true;
                Ok(())
            } else {
                Err(meta.error("unsupported field attribute"))
            }
        })?;
    }
    Ok(skip)
}

fn generate_offsets_body(guarded_gc: &Path, data: &Data) -> syn::Result<TokenStream> {
    match data {
        Data::Struct(data) => generate_struct_offsets(guarded_gc, &data.fields),
        Data::Enum(e) => Ok(quote_spanned! {
            e.enum_token.span => compile_error!("`Scan` can only be derived for structs");
        }),
        Data::Union(u) => Ok(quote_spanned! {
            u.union_token.span => compile_error!("`ScanLayout` must be manually implemented for unions");
        }),
    }
}

fn generate_struct_offsets(guarded_gc: &Path, fields: &Fields) -> syn::Result<TokenStream> {
    let mut extends = Vec::new();
    for (i, field) in fields.iter().enumerate() {
        if is_skipped(field)? {
            continue;
        }
        let member = field
            .ident
            .clone()
            .map_or_else(|| Member::Unnamed(Index::from(i)), Member::Named);
        let ty = &field.ty;
        extends.push(quote_spanned! {field.span() =>
            let base = ::core::mem::offset_of!(Self, #member);
            offsets.extend(
                <#ty as #guarded_gc::ScanLayout>::pointer_offsets()
                    .into_iter()
                    .map(|offset| base + offset),
            );
        });
    }

    Ok(quote! {
        #[allow(unused_mut)]
        let mut offsets = ::std::vec::Vec::new();
        #(#extends)*
        offsets
    })
}
