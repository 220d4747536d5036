//! Request and response modifiers.
//!
//! Modifiers are the proxy's extension surface: the pipeline invokes the
//! request modifier once per request right after stamping, and the
//! response modifier once per response right before the write. A modifier
//! may mutate the message in place, return an error (non-fatal; attached
//! to the message as a `Warning` header), or hijack the session to take
//! ownership of the connection.

use async_trait::async_trait;

use crate::http1::{Request, Response};

use super::session::Context;

/// Mutates requests on their way to the origin.
#[async_trait]
pub trait RequestModifier: Send + Sync {
    /// Modify `req` in place. Errors are downgraded to `Warning` headers.
    async fn modify_request(&self, ctx: &mut Context, req: &mut Request) -> anyhow::Result<()>;
}

/// Mutates responses on their way back to the client.
#[async_trait]
pub trait ResponseModifier: Send + Sync {
    /// Modify `res` in place. Errors are downgraded to `Warning` headers.
    async fn modify_response(&self, ctx: &mut Context, res: &mut Response) -> anyhow::Result<()>;
}

/// Modifier that does nothing. Installed by default.
#[derive(Debug, Clone, Copy, Default)]
pub struct Noop;

#[async_trait]
impl RequestModifier for Noop {
    async fn modify_request(&self, _ctx: &mut Context, _req: &mut Request) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl ResponseModifier for Noop {
    async fn modify_response(&self, _ctx: &mut Context, _res: &mut Response) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Adapt a closure into a [`RequestModifier`].
pub fn request_modifier_fn<F>(f: F) -> impl RequestModifier
where
    F: Fn(&mut Context, &mut Request) -> anyhow::Result<()> + Send + Sync,
{
    struct FnModifier<F>(F);

    #[async_trait]
    impl<F> RequestModifier for FnModifier<F>
    where
        F: Fn(&mut Context, &mut Request) -> anyhow::Result<()> + Send + Sync,
    {
        async fn modify_request(
            &self,
            ctx: &mut Context,
            req: &mut Request,
        ) -> anyhow::Result<()> {
            (self.0)(ctx, req)
        }
    }

    FnModifier(f)
}

/// Adapt a closure into a [`ResponseModifier`].
pub fn response_modifier_fn<F>(f: F) -> impl ResponseModifier
where
    F: Fn(&mut Context, &mut Response) -> anyhow::Result<()> + Send + Sync,
{
    struct FnModifier<F>(F);

    #[async_trait]
    impl<F> ResponseModifier for FnModifier<F>
    where
        F: Fn(&mut Context, &mut Response) -> anyhow::Result<()> + Send + Sync,
    {
        async fn modify_response(
            &self,
            ctx: &mut Context,
            res: &mut Response,
        ) -> anyhow::Result<()> {
            (self.0)(ctx, res)
        }
    }

    FnModifier(f)
}
