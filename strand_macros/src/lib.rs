use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{ItemFn, parse_macro_input};

/// Turns `async fn main(conn: Connection, cx: FiberCx) -> HandlerResult`
/// into a server binary.
///
/// The function becomes the handler of every accepted connection. The
/// generated `main` parses [`Options`](../strand/struct.Options.html) from
/// the command line and hands over to `strand::launch`.
#[proc_macro_attribute]
pub fn main(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);
    expand(input).into()
}

fn expand(input: ItemFn) -> TokenStream2 {
    let name = &input.sig.ident;

    // Ensure the function is async
    if input.sig.asyncness.is_none() {
        return quote! { compile_error!("the #[strand::main] function must be async"); };
    }

    if name != "main" {
        return quote! {
            compile_error!("#[strand::main] can only be applied to the 'main' function");
        };
    }

    if input.sig.inputs.len() != 2 {
        return quote! {
            compile_error!("#[strand::main] expects `async fn main(conn: Connection, cx: FiberCx)`");
        };
    }

    let attrs = &input.attrs;
    let vis = &input.vis;
    let mut handler = input.clone();
    handler.sig.ident = syn::Ident::new("__strand_handler", name.span());
    handler.attrs.clear();
    handler.vis = syn::Visibility::Inherited;

    quote! {
        #(#attrs)*
        #vis fn main() -> ::std::process::ExitCode {
            #handler

            ::strand::launch(
                ::strand::Options::from_args(),
                ::strand::factory(__strand_handler),
            )
        }
    }
}
