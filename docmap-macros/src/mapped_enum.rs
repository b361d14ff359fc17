use proc_macro2::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Fields, LitStr};

pub(crate) fn expand(input: DeriveInput) -> syn::Result<TokenStream> {
    let name = &input.ident;

    let Data::Enum(data) = &input.data else {
        return Err(syn::Error::new(name.span(), "MappedEnum can only be derived for enums"));
    };

    let mut variants = Vec::with_capacity(data.variants.len());
    for variant in &data.variants {
        if !matches!(variant.fields, Fields::Unit) {
            return Err(syn::Error::new_spanned(
                variant,
                "MappedEnum only supports variants without fields",
            ));
        }

        let ident = &variant.ident;
        let stored = LitStr::new(&ident.to_string(), ident.span());
        variants.push((ident, stored));
    }

    let to_name = variants
        .iter()
        .map(|(ident, stored)| quote! { #name::#ident => #stored, });
    let from_name = variants
        .iter()
        .map(|(ident, stored)| quote! { #stored => Some(#name::#ident), });
    let shape_name = LitStr::new(&name.to_string(), name.span());

    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    Ok(quote! {
        impl #impl_generics ::docmap::value::MappedEnum for #name #ty_generics #where_clause {
            fn variant_name(&self) -> &'static str {
                match self {
                    #(#to_name)*
                }
            }

            fn from_variant_name(name: &str) -> Option<Self> {
                match name {
                    #(#from_name)*
                    _ => None,
                }
            }
        }

        impl #impl_generics ::docmap::value::Persist for #name #ty_generics #where_clause {
            fn shape() -> ::docmap::value::TypeShape {
                ::docmap::value::TypeShape::Enum(#shape_name)
            }

            fn to_value(&self) -> ::docmap::MappingResult<::docmap::value::Value> {
                Ok(::docmap::value::enum_to_value(self))
            }

            fn from_value(value: ::docmap::value::Value) -> ::docmap::MappingResult<Self> {
                ::docmap::value::enum_from_value(value)
            }
        }
    })
}
