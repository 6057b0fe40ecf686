use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, FnArg, ItemFn, ReturnType};

/// Runs an `async fn` test as an isolated case on its own bridge.
///
/// The function may take no arguments or a single
/// `core_bridge::CaseHandle`. Failures are re-raised with their original
/// panic payload, so `#[should_panic]` works as usual.
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    expand(attr, item)
}

fn expand(attr: TokenStream, item: TokenStream) -> TokenStream {
    if !attr.is_empty() {
        let tokens = TokenStream2::from(attr);
        return syn::Error::new_spanned(
            tokens,
            "core_bridge::test does not accept arguments yet",
        )
        .to_compile_error()
        .into();
    }

    let input = parse_macro_input!(item as ItemFn);

    match expand_test(input) {
        Ok(tokens) => tokens.into(),
        Err(error) => error.to_compile_error().into(),
    }
}

fn expand_test(input: ItemFn) -> syn::Result<TokenStream2> {
    let sig = &input.sig;

    if sig.asyncness.is_none() {
        return Err(syn::Error::new_spanned(
            sig.fn_token,
            "core_bridge::test requires `async fn`",
        ));
    }
    if !sig.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            &sig.generics,
            "core_bridge::test functions cannot be generic",
        ));
    }
    if let ReturnType::Type(_, ty) = &sig.output {
        return Err(syn::Error::new_spanned(
            ty,
            "core_bridge::test functions must return `()`",
        ));
    }

    let case_param = match sig.inputs.len() {
        0 => quote!(_case: ::core_bridge::CaseHandle),
        1 => match &sig.inputs[0] {
            FnArg::Typed(arg) => {
                let pat = &arg.pat;
                let ty = &arg.ty;
                quote!(#pat: #ty)
            }
            FnArg::Receiver(receiver) => {
                return Err(syn::Error::new_spanned(
                    receiver,
                    "core_bridge::test functions cannot take `self`",
                ));
            }
        },
        _ => {
            return Err(syn::Error::new_spanned(
                &sig.inputs,
                "core_bridge::test functions take at most one `CaseHandle` argument",
            ));
        }
    };

    let attrs = &input.attrs;
    let vis = &input.vis;
    let ident = &sig.ident;
    let block = &input.block;

    Ok(quote! {
        #(#attrs)*
        #[test]
        #vis fn #ident() {
            ::core_bridge::logging::init_test_logging();
            ::core_bridge::IsolatedCase::new(concat!(module_path!(), "::", stringify!(#ident)))
                .async_body(|#case_param| async move #block)
                .run()
                .assert_success();
        }
    })
}
