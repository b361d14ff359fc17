use proc_macro2::TokenStream;
use quote::quote;
use syn::{Attribute, Data, DeriveInput, Expr, Fields, Ident, LitStr, Type, spanned::Spanned};

#[derive(Default)]
struct EntityAttrs {
    collection: Option<LitStr>,
    class_name: Option<LitStr>,
    no_class_name: bool,
    codecs: Vec<Expr>,
    hooks: Vec<(Ident, Ident)>,
}

#[derive(Default)]
struct ReferenceAttrs {
    lazy: bool,
    ignore_missing: bool,
    require_lazy: bool,
}

#[derive(Default)]
struct FieldAttrs {
    role: Option<Ident>,
    reference: Option<ReferenceAttrs>,
    name: Option<LitStr>,
    transient: bool,
}

struct MappedField {
    ident: Ident,
    ty: Type,
    attrs: FieldAttrs,
}

const HOOKS: [(&str, &str); 4] = [
    ("pre_persist", "PrePersist"),
    ("pre_save", "PreSave"),
    ("pre_load", "PreLoad"),
    ("post_load", "PostLoad"),
];

pub(crate) fn expand(input: DeriveInput) -> syn::Result<TokenStream> {
    let name = &input.ident;

    let Data::Struct(data) = &input.data else {
        return Err(syn::Error::new(name.span(), "Entity can only be derived for structs"));
    };
    let Fields::Named(named) = &data.fields else {
        return Err(syn::Error::new(
            data.fields.span(),
            "Entity requires a struct with named fields",
        ));
    };

    let entity = parse_entity_attrs(&input.attrs)?;
    let fields = named
        .named
        .iter()
        .map(|field| {
            Ok(MappedField {
                ident: field.ident.clone().ok_or_else(|| {
                    syn::Error::new(field.span(), "Entity requires named fields")
                })?,
                ty: field.ty.clone(),
                attrs: parse_field_attrs(&field.attrs)?,
            })
        })
        .collect::<syn::Result<Vec<_>>>()?;

    let settings = entity_settings(&entity);
    let registrations = fields
        .iter()
        .filter(|field| !field.attrs.transient)
        .map(field_registration);

    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    Ok(quote! {
        impl #impl_generics ::docmap::Entity for #name #ty_generics #where_clause {
            fn describe(builder: &mut ::docmap::DescriptorBuilder<Self>) {
                #(#settings)*
                #(#registrations)*
            }
        }

        impl #impl_generics ::docmap::value::Persist for #name #ty_generics #where_clause {
            fn shape() -> ::docmap::value::TypeShape {
                ::docmap::value::TypeShape::Entity(::docmap::EntityType::of::<Self>())
            }

            fn to_value(&self) -> ::docmap::MappingResult<::docmap::value::Value> {
                Ok(::docmap::value::embed(self))
            }

            fn from_value(value: ::docmap::value::Value) -> ::docmap::MappingResult<Self> {
                ::docmap::value::unembed(value)
            }
        }
    })
}

fn entity_settings(entity: &EntityAttrs) -> Vec<TokenStream> {
    let mut settings = Vec::new();

    if let Some(collection) = &entity.collection {
        settings.push(quote! { builder.collection(#collection); });
    }
    if let Some(class_name) = &entity.class_name {
        settings.push(quote! { builder.class_name(#class_name); });
    }
    if entity.no_class_name {
        settings.push(quote! { builder.no_class_name(); });
    }
    for codec in &entity.codecs {
        settings.push(quote! { builder.codec(#codec); });
    }
    for (phase, method) in &entity.hooks {
        settings.push(quote! {
            builder.hook(::docmap::LifecyclePhase::#phase, |entity, document| {
                entity.#method(document);
            });
        });
    }

    settings
}

fn field_registration(field: &MappedField) -> TokenStream {
    let ident = &field.ident;
    let ty = &field.ty;
    let member = LitStr::new(&ident.to_string(), ident.span());

    let mut chain = Vec::new();
    if let Some(role) = &field.attrs.role {
        chain.push(quote! { .#role() });
    }
    if let Some(reference) = &field.attrs.reference {
        chain.push(quote! { .reference() });
        if reference.lazy {
            chain.push(quote! { .lazy() });
        }
        if reference.ignore_missing {
            chain.push(quote! { .ignore_missing() });
        }
        if reference.require_lazy {
            chain.push(quote! { .require_lazy() });
        }
    }
    if let Some(stored) = &field.attrs.name {
        chain.push(quote! { .rename(#stored) });
    }

    quote! {
        builder
            .field::<#ty>(#member, |entity| &entity.#ident, |entity| &mut entity.#ident)
            #(#chain)*;
    }
}

fn parse_entity_attrs(attrs: &[Attribute]) -> syn::Result<EntityAttrs> {
    let mut entity = EntityAttrs::default();

    for attr in attrs.iter().filter(|attr| attr.path().is_ident("entity")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("collection") {
                entity.collection = Some(meta.value()?.parse()?);
                return Ok(());
            }

            if meta.path.is_ident("class_name") {
                entity.class_name = Some(meta.value()?.parse()?);
                return Ok(());
            }

            if meta.path.is_ident("no_class_name") {
                entity.no_class_name = true;
                return Ok(());
            }

            if meta.path.is_ident("codec") {
                let source: LitStr = meta.value()?.parse()?;
                entity.codecs.push(source.parse()?);
                return Ok(());
            }

            for (key, phase) in HOOKS {
                if meta.path.is_ident(key) {
                    let method: LitStr = meta.value()?.parse()?;
                    entity.hooks.push((
                        Ident::new(phase, method.span()),
                        method.parse()?,
                    ));
                    return Ok(());
                }
            }

            Err(meta.error(
                "unknown entity attribute. Supported: collection, class_name, no_class_name, \
                 codec, pre_persist, pre_save, pre_load, post_load",
            ))
        })?;
    }

    Ok(entity)
}

fn parse_field_attrs(attrs: &[Attribute]) -> syn::Result<FieldAttrs> {
    let mut field = FieldAttrs::default();

    for attr in attrs.iter().filter(|attr| attr.path().is_ident("mapped")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("transient") {
                field.transient = true;
                return Ok(());
            }

            if meta.path.is_ident("name") {
                field.name = Some(meta.value()?.parse()?);
                return Ok(());
            }

            if meta.path.is_ident("reference") {
                let mut reference = ReferenceAttrs::default();

                if meta.input.peek(syn::token::Paren) {
                    meta.parse_nested_meta(|option| {
                        if option.path.is_ident("lazy") {
                            reference.lazy = true;
                        } else if option.path.is_ident("ignore_missing") {
                            reference.ignore_missing = true;
                        } else if option.path.is_ident("require_lazy") {
                            reference.require_lazy = true;
                        } else {
                            return Err(option.error(
                                "unknown reference option. Supported: lazy, ignore_missing, \
                                 require_lazy",
                            ));
                        }
                        Ok(())
                    })?;
                }

                field.reference = Some(reference);
                return Ok(());
            }

            for role in ["id", "version", "embedded", "property"] {
                if meta.path.is_ident(role) {
                    if field.role.is_some() {
                        return Err(meta.error("a field can only have one role"));
                    }
                    field.role = meta.path.get_ident().cloned();
                    return Ok(());
                }
            }

            Err(meta.error(
                "unknown mapped attribute. Supported: id, version, embedded, property, \
                 transient, reference, name",
            ))
        })?;
    }

    if field.role.is_some() && field.reference.is_some() {
        return Err(syn::Error::new(
            attrs[0].span(),
            "a reference field cannot also declare another role",
        ));
    }

    Ok(field)
}
