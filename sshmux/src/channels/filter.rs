// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
use crate::Error;

/// A transformation applied to the bytes of a stream channel.
///
/// `inbound` sees what the peer sends, before it reaches the local
/// output; `outbound` sees what is read from the local input, before
/// it is sent. An outbound filter may drop bytes, but not add any:
/// they have already been accounted for in the peer's window.
///
/// Returning an error closes the channel.
pub trait StreamFilter: Send {
    fn inbound(&mut self, data: Vec<u8>) -> Result<Vec<u8>, Error> {
        Ok(data)
    }

    fn outbound(&mut self, data: Vec<u8>) -> Result<Vec<u8>, Error> {
        Ok(data)
    }
}
