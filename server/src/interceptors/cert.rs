use tonic::{Request, Status};
use x509_parser::prelude::*;

/// The authenticated identity of the calling client, extracted from its
/// certificate and inserted into the request extensions for handlers to
/// read.
pub struct PrincipalExtension {
    pub principal: String,
}

/// A tonic interceptor service function.
///
/// Requires exactly one client certificate on the connection and records the
/// certificate's subject common name as the caller's principal.
///
/// Every failure maps to the same `NotFound` status the authorization checks
/// use, so a probing client cannot tell a bad credential from a missing job.
pub fn extract_principal(mut req: Request<()>) -> Result<Request<()>, Status> {
    let client_certs = req.peer_certs().ok_or_else(not_found)?;
    if client_certs.len() != 1 {
        return Err(not_found());
    }

    // rustls hands us the DER encoded certificate
    let der = client_certs[0].get_ref();
    let (rem, cert) = X509Certificate::from_der(der).map_err(|_| not_found())?;
    if !rem.is_empty() {
        return Err(not_found());
    }

    let principal = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .ok_or_else(not_found)?
        .to_string();

    req.extensions_mut().insert(PrincipalExtension { principal });
    Ok(req)
}

fn not_found() -> Status {
    Status::not_found("job not found")
}
